//! Shared test fakes: condvar-backed signals, a recording RTOS, a
//! recording window port, slot-image packing, and a leaked test bench
//! wiring everything into a `'static` manager.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use quartzos_app_proto::{self as proto, ApplicationHeader};

use crate::app::arena::Arena;
use crate::app::{AppManager, SymbolTable};
use crate::flash::MemFlash;
use crate::port::{
    HeapRegion, Rtos, Signal, SpawnError, TaskEntry, TaskId, TaskPriority, TaskStack,
};
use crate::resources::{BitmapHandle, FontHandle, ResHandle, ResourceStore};
use crate::ui::{ButtonId, ClickHandler, WindowPort};

pub struct HostSignal {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl HostSignal {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            cv: Condvar::new(),
        }
    }
}

impl Signal for HostSignal {
    fn wait(&self, timeout_ticks: Option<u32>) -> bool {
        let mut pending = self.pending.lock().unwrap();
        match timeout_ticks {
            None => {
                while !*pending {
                    pending = self.cv.wait(pending).unwrap();
                }
                *pending = false;
                true
            }
            Some(ticks) => {
                // one tick is one millisecond on the host
                let mut remaining = Duration::from_millis(ticks as u64);
                while !*pending && !remaining.is_zero() {
                    let started = Instant::now();
                    let (guard, result) = self.cv.wait_timeout(pending, remaining).unwrap();
                    pending = guard;
                    if result.timed_out() {
                        break;
                    }
                    remaining = remaining.saturating_sub(started.elapsed());
                }
                let notified = *pending;
                *pending = false;
                notified
            }
        }
    }

    fn notify(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.cv.notify_one();
    }

    fn notify_from_isr(&self) -> bool {
        self.notify();
        false
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SpawnRecord {
    pub id: TaskId,
    pub name: &'static str,
    pub entry_addr: usize,
    pub is_internal: bool,
    pub stack: TaskStack,
    pub priority: TaskPriority,
}

/// Records spawns and deletes instead of scheduling anything; tests run
/// task bodies by hand where a scenario needs them.
pub struct FakeRtos {
    next_id: AtomicUsize,
    pub spawned: Mutex<Vec<SpawnRecord>>,
    pub deleted: Mutex<Vec<TaskId>>,
    pub heaps: Mutex<Vec<HeapRegion>>,
}

impl FakeRtos {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            spawned: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            heaps: Mutex::new(Vec::new()),
        }
    }

    pub fn spawns_named(&self, name: &str) -> Vec<SpawnRecord> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.name == name)
            .copied()
            .collect()
    }

    /// Spawned-but-not-deleted tasks with the given name.
    pub fn live_count(&self, name: &str) -> usize {
        let deleted = self.deleted.lock().unwrap();
        self.spawns_named(name)
            .iter()
            .filter(|r| !deleted.contains(&r.id))
            .count()
    }

    pub fn last_spawn(&self) -> Option<SpawnRecord> {
        self.spawned.lock().unwrap().last().copied()
    }
}

impl Rtos for FakeRtos {
    fn spawn_task(
        &self,
        _mgr: &'static AppManager,
        name: &'static str,
        entry: TaskEntry,
        stack: TaskStack,
        priority: TaskPriority,
    ) -> Result<TaskId, SpawnError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (entry_addr, is_internal) = match entry {
            TaskEntry::Internal(f) => (f as usize, true),
            TaskEntry::Image(addr) => (addr, false),
        };
        self.spawned.lock().unwrap().push(SpawnRecord {
            id,
            name,
            entry_addr,
            is_internal,
            stack,
            priority,
        });
        Ok(id)
    }

    fn delete_task(&self, id: TaskId) {
        self.deleted.lock().unwrap().push(id);
    }

    fn make_signal(&self) -> Box<dyn Signal> {
        Box::new(HostSignal::new())
    }

    fn init_guest_heap(&self, heap: HeapRegion) {
        self.heaps.lock().unwrap().push(heap);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Subscription {
    pub button: ButtonId,
    pub handler: usize,
    pub context: usize,
}

/// Current subscriptions plus an append-only history, so tests can ask
/// "was it ever installed" after the pump's quit path cleared the live
/// set.
#[derive(Default)]
pub struct FakeWindow {
    pub single_subs: Mutex<Vec<Subscription>>,
    pub long_subs: Mutex<Vec<Subscription>>,
    pub single_history: Mutex<Vec<Subscription>>,
    pub long_history: Mutex<Vec<Subscription>>,
    pub unsubscribe_all_count: AtomicUsize,
    pub tick_unsubscribe_count: AtomicUsize,
    pub dirty_count: AtomicUsize,
}

impl FakeWindow {
    pub fn select_subscribed(&self) -> bool {
        self.single_subs
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.button == ButtonId::Select)
    }

    pub fn select_was_subscribed(&self) -> bool {
        self.single_history
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.button == ButtonId::Select)
    }
}

impl WindowPort for FakeWindow {
    fn load_window_proc(&self) {}

    fn load_click_config(&self) {}

    fn single_click_subscribe(&self, button: ButtonId, handler: ClickHandler, context: *mut ()) {
        let sub = Subscription {
            button,
            handler: handler as usize,
            context: context as usize,
        };
        self.single_subs.lock().unwrap().push(sub);
        self.single_history.lock().unwrap().push(sub);
    }

    fn long_click_subscribe(
        &self,
        button: ButtonId,
        _delay_ms: u32,
        handler: ClickHandler,
        context: *mut (),
    ) {
        let sub = Subscription {
            button,
            handler: handler as usize,
            context: context as usize,
        };
        self.long_subs.lock().unwrap().push(sub);
        self.long_history.lock().unwrap().push(sub);
    }

    fn button_unsubscribe_all(&self) {
        self.single_subs.lock().unwrap().clear();
        self.long_subs.lock().unwrap().clear();
        self.unsubscribe_all_count.fetch_add(1, Ordering::Relaxed);
    }

    fn tick_service_unsubscribe(&self) {
        self.tick_unsubscribe_count.fetch_add(1, Ordering::Relaxed);
    }

    fn mark_dirty(&self) {
        self.dirty_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Tags every answer with the slot it was asked for, so tests can check
/// the proxies capture the running app's slot.
pub struct FakeResources;

impl ResourceStore for FakeResources {
    fn bitmap(&self, resource_id: u32, slot: u8) -> Option<BitmapHandle> {
        Some(BitmapHandle((resource_id << 8) | slot as u32))
    }

    fn handle(&self, resource_id: u16, slot: u8) -> Option<ResHandle> {
        Some(ResHandle(((resource_id as u32) << 8) | slot as u32))
    }

    fn custom_font(&self, handle: ResHandle, slot: u8) -> Option<FontHandle> {
        Some(FontHandle((handle.0 << 8) | slot as u32))
    }
}

/// A word-aligned arena over a leaked buffer.
pub fn test_arena(len: usize) -> Arena {
    let words = Box::leak(vec![0u32; len.div_ceil(4)].into_boxed_slice());
    unsafe { Arena::from_raw(words.as_mut_ptr() as *mut u8, len) }
}

/// Assemble one slot image: header (checksum and counts recomputed from
/// the parts) followed by the binary and the relocation table.
pub fn packed_slot(header: &ApplicationHeader, body: &[u8], relocs: &[u32]) -> Vec<u8> {
    let mut header = *header;
    header.app_size = body.len() as u32;
    header.crc = proto::crc32::crc32_ieee(body);
    header.reloc_entries_count = relocs.len() as u32;

    let mut hdr_buf = [0u8; proto::HEADER_SIZE];
    header.encode(&mut hdr_buf);

    let mut out = Vec::with_capacity(proto::HEADER_SIZE + body.len() + relocs.len() * 4);
    out.extend_from_slice(&hdr_buf);
    out.extend_from_slice(body);
    for r in relocs {
        out.extend_from_slice(&r.to_le_bytes());
    }
    out
}

pub struct TestBench {
    pub mgr: &'static AppManager,
    pub rtos: &'static FakeRtos,
    pub window: &'static FakeWindow,
}

pub fn bench_with_flash(flash: MemFlash) -> TestBench {
    let rtos: &'static FakeRtos = Box::leak(Box::new(FakeRtos::new()));
    let window: &'static FakeWindow = Box::leak(Box::new(FakeWindow::default()));
    let resources: &'static FakeResources = Box::leak(Box::new(FakeResources));
    let flash: &'static MemFlash = Box::leak(Box::new(flash));
    let arena = test_arena(crate::config::MAX_APP_MEMORY_SIZE);
    let mgr = Box::leak(Box::new(AppManager::new(
        rtos,
        flash,
        window,
        resources,
        SymbolTable::at_addr(0x0800_4000),
        arena,
    )));
    TestBench { mgr, rtos, window }
}

pub fn bench() -> TestBench {
    bench_with_flash(MemFlash::blank())
}
