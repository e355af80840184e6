//! Application-manager tunables, collected in one place.

use crate::port::TaskPriority;

/// Bytes of the statically reserved guest arena (binary + BSS + heap +
/// stack all live here).
pub const MAX_APP_MEMORY_SIZE: usize = 64 * 1024;

/// Guest stack size in 32-bit words, carved from the top of the arena.
pub const MAX_APP_STACK_SIZE: usize = 4096;

/// Highest flash slot scanned at boot is `APP_SLOT_COUNT - 1`.
pub const APP_SLOT_COUNT: u8 = quartzos_app_proto::SLOT_COUNT;

/// Depth of the UI event queue (button / tick / quit).
pub const APP_MESSAGE_QUEUE_DEPTH: usize = 5;

/// Depth of the start-request queue. One in flight is enough: the
/// controller finishes a transition before accepting the next.
pub const APP_THREAD_QUEUE_DEPTH: usize = 1;

/// Ticks a start request may wait for queue space before it is dropped.
pub const START_SEND_TIMEOUT_TICKS: u32 = 100;

/// Ticks a quit or button post may wait for queue space.
pub const EVENT_SEND_TIMEOUT_TICKS: u32 = 10;

/// Bounded block of the event pump on an empty queue.
pub const EVENT_RECV_TIMEOUT_TICKS: u32 = 1000;

/// Controller stack in words; the controller itself does little work.
pub const CONTROLLER_STACK_WORDS: usize = 300;

pub const CONTROLLER_TASK_PRIORITY: TaskPriority = TaskPriority::idle_plus(5);

/// Guest outranks the controller so a runnable app preempts loads.
pub const APP_TASK_PRIORITY: TaskPriority = TaskPriority::idle_plus(6);
