//! Contracts the host RTOS must satisfy.
//!
//! The application manager never talks to a scheduler directly; the
//! embedder supplies an [`Rtos`] implementation bound to the real kernel
//! (task create/delete, blocking, guest heap binding), and tests supply
//! recording fakes. Everything here is deliberately small: the manager
//! needs preemptive tasks, a blocking/wakeup cell per queue direction,
//! and a way to hand the guest allocator its memory range.

use alloc::boxed::Box;

use crate::app::AppManager;

pub type TaskId = usize;

/// Priority relative to the RTOS idle task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskPriority(u8);

impl TaskPriority {
    pub const fn idle_plus(n: u8) -> Self {
        Self(n)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }
}

/// What a newly spawned task executes.
#[derive(Clone, Copy)]
pub enum TaskEntry {
    /// Host-linked entry function of a built-in app (or the controller).
    Internal(fn(&'static AppManager)),
    /// Absolute address of a relocated guest entry point inside the arena.
    /// The port jumps there with the guest stack installed.
    Image(usize),
}

/// Stack placement for a new task.
#[derive(Clone, Copy, Debug)]
pub enum TaskStack {
    /// RTOS-allocated stack of the given word count.
    Kernel { words: usize },
    /// Fixed region carved from the guest arena.
    Arena(StackRegion),
}

/// A stack range: `base` is the lowest address, `words` the size in
/// 32-bit words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackRegion {
    pub base: usize,
    pub words: usize,
}

/// Byte range handed to the guest allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapRegion {
    pub base: usize,
    pub size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpawnError {
    OutOfMemory,
}

/// A binary-semaphore style wakeup cell.
///
/// A `notify` that arrives while nobody waits must be latched so the next
/// `wait` consumes it immediately; queue send/receive relies on this to
/// close the unlock-then-wait window.
pub trait Signal: Send + Sync {
    /// Block until notified or until `timeout_ticks` elapse; `None` waits
    /// forever. Returns false on timeout.
    fn wait(&self, timeout_ticks: Option<u32>) -> bool;

    fn notify(&self);

    /// ISR-safe notify. Returns true when a higher-priority task became
    /// runnable, for the caller to forward as a context-switch request.
    fn notify_from_isr(&self) -> bool;
}

pub trait Rtos: Send + Sync {
    /// Create a preemptively scheduled task. `Internal` entries are called
    /// with the manager singleton; `Image` entries are jumped to raw.
    fn spawn_task(
        &self,
        mgr: &'static AppManager,
        name: &'static str,
        entry: TaskEntry,
        stack: TaskStack,
        priority: TaskPriority,
    ) -> Result<TaskId, SpawnError>;

    /// Hard termination. No teardown the task registered is run; the
    /// manager only uses this on a guest that already saw its quit (or
    /// refused to).
    fn delete_task(&self, id: TaskId);

    fn make_signal(&self) -> Box<dyn Signal>;

    /// Bind the guest allocator to `heap` before the guest task first
    /// runs. The range is inside the arena and is reissued on every app
    /// transition.
    fn init_guest_heap(&self, heap: HeapRegion);
}
