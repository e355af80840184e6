//! Application lifecycle: boot-time manifest scan, start/quit control,
//! and the event pump every guest runs.
//!
//! One controller task owns all transitions. It parks on a start-request
//! queue; a request names an app, the controller kills whatever still
//! runs, loads the newcomer (flash apps) or reuses its host-linked entry
//! (built-ins), and spawns it as the single guest task. UI events flow
//! through a second queue straight to the guest.

pub mod arena;
pub mod loader;
pub mod manifest;

use alloc::string::{String, ToString};
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, error, info};
use spin::Mutex;

use quartzos_app_proto::{self as proto, ApplicationHeader};

use crate::apps;
use crate::config::{
    APP_MESSAGE_QUEUE_DEPTH, APP_SLOT_COUNT, APP_TASK_PRIORITY, APP_THREAD_QUEUE_DEPTH,
    CONTROLLER_STACK_WORDS, CONTROLLER_TASK_PRIORITY, EVENT_RECV_TIMEOUT_TICKS,
    EVENT_SEND_TIMEOUT_TICKS, START_SEND_TIMEOUT_TICKS,
};
use crate::flash::{FlashDriver, FlashError};
use crate::port::{Rtos, TaskEntry, TaskId, TaskStack};
use crate::resources::{BitmapHandle, FontHandle, ResHandle, ResourceStore};
use crate::sync::queue::MessageQueue;
use crate::time::TickMessage;
use crate::ui::{ButtonId, ButtonMessage, ClickRecognizerRef, WindowPort};

use arena::Arena;

pub use loader::{LoadedImage, SymbolTable};
pub use manifest::{AppRecord, AppType, Manifest};

/// Entry signature of host-linked (built-in) applications.
pub type AppEntry = fn(&'static AppManager);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppError {
    /// Name not in the manifest.
    NotFound,
    /// Flash would not deliver the bundle.
    LoadFailed,
    /// Image plus reserved stack overflows the arena.
    TooBig,
    /// Relocation entry points outside the binary.
    BadReloc,
    /// Queue send timed out.
    QueueFull,
    /// Header shape or checksum wrong.
    InvalidBinary,
    /// The RTOS refused the task.
    SpawnFailed,
}

/// Events multiplexed onto the running application.
pub enum AppMessage {
    Button(ButtonMessage),
    Tick(TickMessage),
    Quit,
}

struct StartRequest {
    name: String,
}

const NO_RUNNING_APP: usize = usize::MAX;

/// Process-wide application manager. Built once at boot and never
/// re-initialized; embedders keep it in a `'static`.
pub struct AppManager {
    rtos: &'static dyn Rtos,
    flash: &'static dyn FlashDriver,
    window: &'static dyn WindowPort,
    resources: &'static dyn ResourceStore,
    sym: SymbolTable,
    manifest: Manifest,
    arena: Mutex<Arena>,
    msg_q: MessageQueue<AppMessage>,
    thread_q: MessageQueue<StartRequest>,
    /// Manifest index of the running app. Written only by the controller
    /// task; everyone else just samples it.
    running: AtomicUsize,
    guest_task: Mutex<Option<TaskId>>,
}

impl AppManager {
    /// Build the manifest (built-ins in fixed order, then the flash scan)
    /// and the queues. The controller is not running yet; call
    /// [`AppManager::init`] once the manager has its final address.
    pub fn new(
        rtos: &'static dyn Rtos,
        flash: &'static dyn FlashDriver,
        window: &'static dyn WindowPort,
        resources: &'static dyn ResourceStore,
        sym: SymbolTable,
        arena: Arena,
    ) -> Self {
        let mut manifest = Manifest::new();
        manifest.add(AppRecord::internal(
            "System",
            AppType::System,
            apps::system::main,
        ));
        manifest.add(AppRecord::internal(
            "Simple",
            AppType::Face,
            apps::simple::main,
        ));
        manifest.add(AppRecord::internal("NiVZ", AppType::Face, apps::nivz::main));
        scan_flash(flash, &mut manifest);

        Self {
            rtos,
            flash,
            window,
            resources,
            sym,
            manifest,
            arena: Mutex::new(arena),
            msg_q: MessageQueue::new(APP_MESSAGE_QUEUE_DEPTH, rtos),
            thread_q: MessageQueue::new(APP_THREAD_QUEUE_DEPTH, rtos),
            running: AtomicUsize::new(NO_RUNNING_APP),
            guest_task: Mutex::new(None),
        }
    }

    /// Boot entry: queue the system app and start the controller task.
    pub fn init(&'static self) -> Result<TaskId, AppError> {
        self.start("System")?;
        let id = self
            .rtos
            .spawn_task(
                self,
                "appmgr",
                TaskEntry::Internal(controller_task_main),
                TaskStack::Kernel {
                    words: CONTROLLER_STACK_WORDS,
                },
                CONTROLLER_TASK_PRIORITY,
            )
            .map_err(|_| AppError::SpawnFailed)?;
        info!("app: controller task created");
        Ok(id)
    }

    /// Ask the running app to exit and queue `name` as its replacement.
    /// The quit is delivered first so a cooperative guest can leave on
    /// its own; the controller force-deletes whatever remains.
    pub fn start(&self, name: &str) -> Result<(), AppError> {
        let _ = self.quit();
        self.thread_q
            .send_back(
                StartRequest {
                    name: name.to_string(),
                },
                Some(START_SEND_TIMEOUT_TICKS),
            )
            .map_err(|_| {
                error!("app: start request dropped for {}", name);
                AppError::QueueFull
            })
    }

    /// Post a quit to the running app's event queue.
    pub fn quit(&self) -> Result<(), AppError> {
        self.msg_q
            .send_back(AppMessage::Quit, Some(EVENT_SEND_TIMEOUT_TICKS))
            .map_err(|_| {
                error!("app: quit dropped");
                AppError::QueueFull
            })
    }

    /// Hand a recognized gesture to the running app.
    pub fn post_button_message(&self, message: ButtonMessage) -> Result<(), AppError> {
        self.msg_q
            .send_back(AppMessage::Button(message), Some(EVENT_SEND_TIMEOUT_TICKS))
            .map_err(|_| {
                error!("app: button dropped");
                AppError::QueueFull
            })
    }

    /// Hand a tick event to the running app. Safe from interrupt context:
    /// never blocks, drops silently under backpressure.
    /// `higher_prio_woken` reports whether the post made a
    /// higher-priority task runnable, for the ISR's context-switch
    /// decision.
    pub fn post_tick_message(
        &self,
        message: TickMessage,
        higher_prio_woken: &mut bool,
    ) -> Result<(), AppError> {
        *higher_prio_woken = false;
        self.msg_q
            .send_back_from_isr(AppMessage::Tick(message), higher_prio_woken)
            .map_err(|_| AppError::QueueFull)
    }

    /// The running app's record, while a guest exists.
    pub fn running_app(&self) -> Option<&AppRecord> {
        let index = self.running.load(Ordering::Acquire);
        if index == NO_RUNNING_APP {
            return None;
        }
        self.manifest.get(index)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// First manifest record, for UI enumeration.
    pub fn apps_head(&self) -> Option<&AppRecord> {
        self.manifest.head()
    }

    /// Event pump. Every guest `main` ends up here: installs the window
    /// hooks, then multiplexes buttons, ticks and quits onto the app
    /// until a quit arrives. Callbacks run inline on the guest task, so a
    /// slow callback blocks further events until it returns.
    pub fn app_event_loop(&'static self) {
        info!("app: entered mainloop");

        self.window.load_window_proc();
        self.window.load_click_config();

        let context = self as *const AppManager as *mut ();
        self.window
            .long_click_subscribe(ButtonId::Back, 1100, back_long_click_handler, context);
        if self.running_app().map(|r| r.app_type) != Some(AppType::System) {
            self.window
                .single_click_subscribe(ButtonId::Select, app_select_single_click_handler, context);
        }

        self.window.mark_dirty();

        loop {
            let Some(message) = self.msg_q.receive(Some(EVENT_RECV_TIMEOUT_TICKS)) else {
                continue;
            };
            match message {
                AppMessage::Button(m) => (m.callback)(m.clickref, m.context),
                AppMessage::Tick(m) => (m.callback)(m.tick_time, m.tick_units),
                AppMessage::Quit => {
                    self.window.button_unsubscribe_all();
                    self.window.tick_service_unsubscribe();
                    info!("app: quit");
                    // Deleting the guest task tears down the caller on
                    // real hardware; control only reaches the break in
                    // hosted tests.
                    if let Some(id) = self.guest_task.lock().take() {
                        self.rtos.delete_task(id);
                    }
                    break;
                }
            }
        }
    }

    /// One controller transition: park for a start request, then execute
    /// it. Runs forever inside the controller task.
    fn controller_step(&'static self) {
        let Some(request) = self.thread_q.receive(None) else {
            return;
        };
        info!("app: starting app {}", request.name);

        // Whatever the previous app left queued is not for the newcomer.
        self.msg_q.reset();

        if let Err(e) = self.exec_start(&request.name) {
            error!("app: start {} failed: {:?}", request.name, e);
        }
    }

    fn exec_start(&'static self, name: &str) -> Result<(), AppError> {
        let index = self.manifest.lookup_index(name).ok_or(AppError::NotFound)?;

        // A guest that never processed its quit dies the hard way.
        if let Some(stale) = self.guest_task.lock().take() {
            self.rtos.delete_task(stale);
        }

        let record = self.manifest.get(index).ok_or(AppError::NotFound)?;
        if record.is_internal {
            self.spawn_internal(index, record)
        } else {
            self.spawn_from_flash(index, record)
        }
    }

    fn spawn_internal(&'static self, index: usize, record: &AppRecord) -> Result<(), AppError> {
        let entry = record.entry.ok_or(AppError::LoadFailed)?;
        let (heap, stack) = {
            let arena = self.arena.lock();
            // No image: the whole non-stack arena becomes guest heap.
            (arena.heap_region(0), arena.stack_region())
        };
        self.running.store(index, Ordering::Release);
        self.rtos.init_guest_heap(heap);
        let id = self
            .rtos
            .spawn_task(
                self,
                "dynapp",
                TaskEntry::Internal(entry),
                TaskStack::Arena(stack),
                APP_TASK_PRIORITY,
            )
            .map_err(|_| AppError::SpawnFailed)?;
        *self.guest_task.lock() = Some(id);
        Ok(())
    }

    fn spawn_from_flash(&'static self, index: usize, record: &AppRecord) -> Result<(), AppError> {
        let image = {
            let mut arena = self.arena.lock();
            loader::load(self.flash, record.slot_id, &mut arena, self.sym)?
        };
        self.running.store(index, Ordering::Release);
        self.rtos.init_guest_heap(image.heap);
        let id = self
            .rtos
            .spawn_task(
                self,
                "dynapp",
                TaskEntry::Image(image.entry_addr),
                TaskStack::Arena(image.stack),
                APP_TASK_PRIORITY,
            )
            .map_err(|_| AppError::SpawnFailed)?;
        *self.guest_task.lock() = Some(id);
        Ok(())
    }

    /// Fetch a bitmap resource for the running app. The slot is sampled
    /// at call time; do not call while a start is replacing the app.
    pub fn bitmap_with_resource(&self, resource_id: u32) -> Option<BitmapHandle> {
        let slot = self.running_app()?.slot_id;
        self.resources.bitmap(resource_id, slot)
    }

    pub fn resource_get_handle(&self, resource_id: u16) -> Option<ResHandle> {
        let slot = self.running_app()?.slot_id;
        debug!("app: resource handle {} slot {}", resource_id, slot);
        self.resources.handle(resource_id, slot)
    }

    pub fn load_custom_font(&self, handle: ResHandle) -> Option<FontHandle> {
        let slot = self.running_app()?.slot_id;
        self.resources.custom_font(handle, slot)
    }
}

fn controller_task_main(mgr: &'static AppManager) {
    loop {
        mgr.controller_step();
    }
}

fn app_select_single_click_handler(_recognizer: ClickRecognizerRef, context: *mut ()) {
    let mgr: &'static AppManager = unsafe { &*(context as *const AppManager) };
    match mgr.running_app().map(|r| r.app_type) {
        Some(AppType::Face) => {
            let _ = mgr.start("System");
        }
        Some(AppType::System) => apps::system::menu_select(mgr),
        _ => {}
    }
}

fn back_long_click_handler(_recognizer: ClickRecognizerRef, context: *mut ()) {
    let mgr: &'static AppManager = unsafe { &*(context as *const AppManager) };
    match mgr.running_app().map(|r| r.app_type) {
        Some(AppType::System) => {
            let _ = mgr.start("Simple");
        }
        Some(AppType::Face) => debug!("app: quiet time"),
        _ => {}
    }
}

/// Scan every flash slot for an application signature and append the
/// valid ones to the manifest. A slot whose binary fails its checksum is
/// skipped; the part may hold a half-written install.
fn scan_flash(flash: &dyn FlashDriver, manifest: &mut Manifest) {
    for slot in 0..APP_SLOT_COUNT {
        let mut buf = [0u8; proto::HEADER_SIZE];
        if flash.read(slot, 0, &mut buf).is_err() {
            continue;
        }
        let Ok(header) = ApplicationHeader::parse(&buf) else {
            continue;
        };
        match slot_crc_ok(flash, slot, &header) {
            Ok(true) => {}
            Ok(false) => {
                error!("app: slot {} crc mismatch, skipping {}", slot, header.name());
                continue;
            }
            Err(e) => {
                error!("app: slot {} unreadable: {:?}", slot, e);
                continue;
            }
        }
        info!("app: valid app found {}", header.name());
        manifest.add(AppRecord {
            name: header.name().to_string(),
            // Refining the type from header flags still pending; every
            // flash app behaves as a face for now.
            app_type: AppType::Face,
            entry: None,
            is_internal: false,
            slot_id: slot,
            header: Some(header),
        });
    }
}

fn slot_crc_ok(
    flash: &dyn FlashDriver,
    slot: u8,
    header: &ApplicationHeader,
) -> Result<bool, FlashError> {
    let mut crc = proto::crc32::init();
    let mut offset = proto::HEADER_SIZE as u32;
    let mut remaining = header.app_size as usize;
    let mut chunk = [0u8; 256];
    while remaining > 0 {
        let take = remaining.min(chunk.len());
        flash.read(slot, offset, &mut chunk[..take])?;
        crc = proto::crc32::update(crc, &chunk[..take]);
        offset += take as u32;
        remaining -= take;
    }
    Ok(proto::crc32::finalize(crc) == header.crc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{APP_TASK_PRIORITY, MAX_APP_MEMORY_SIZE};
    use crate::flash::MemFlash;
    use crate::testutil::{bench, bench_with_flash, packed_slot, TestBench};
    use crate::time::{TickTime, TimeUnits};
    use quartzos_app_proto::{encode_name, Version, APP_MAGIC};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;
    use std::sync::OnceLock;

    fn face_header(name: &str, virtual_size: u32) -> ApplicationHeader {
        ApplicationHeader {
            magic: APP_MAGIC,
            sdk_version: Version::new(5, 19),
            app_version: Version::new(1, 0),
            app_size: 0,
            offset: 0x20,
            crc: 0,
            name: encode_name(name),
            company: encode_name("quartz"),
            icon_resource_id: 0,
            sym_table_addr: 0x10,
            flags: 0,
            reloc_entries_count: 0,
            virtual_size,
        }
    }

    /// Boot, run one controller transition, leave the system app up.
    fn booted(b: &TestBench) {
        b.mgr.init().unwrap();
        b.mgr.controller_step();
    }

    #[test]
    fn boot_start_spawns_the_system_app() {
        let b = bench();
        booted(&b);

        assert_eq!(b.rtos.spawns_named("appmgr").len(), 1);
        let guest = b.rtos.last_spawn().unwrap();
        assert_eq!(guest.name, "dynapp");
        assert!(guest.is_internal);
        assert_eq!(guest.entry_addr, crate::apps::system::main as usize);
        assert_eq!(guest.priority, APP_TASK_PRIORITY);
        assert_eq!(b.rtos.live_count("dynapp"), 1);
        let running = b.mgr.running_app().unwrap();
        assert_eq!(running.name, "System");
        assert_eq!(running.app_type, AppType::System);

        // an internal app gets the whole non-stack arena as heap
        let TaskStack::Arena(stack) = guest.stack else {
            panic!("guest stack must come from the arena");
        };
        let arena_base = stack.base + stack.words * 4 - MAX_APP_MEMORY_SIZE;
        let heap = *b.rtos.heaps.lock().unwrap().last().unwrap();
        assert_eq!(heap.base, arena_base);
        assert_eq!(heap.base + heap.size, stack.base);

        // the system app's pump must not install the select handler
        b.mgr.quit().unwrap();
        b.mgr.app_event_loop();
        assert!(!b.window.select_was_subscribed());
        assert!(b.window.unsubscribe_all_count.load(AtomicOrdering::Relaxed) >= 1);
        assert!(b.window.tick_unsubscribe_count.load(AtomicOrdering::Relaxed) >= 1);
        assert_eq!(b.rtos.live_count("dynapp"), 0);
    }

    #[test]
    fn button_handler_switches_system_to_a_face() {
        let b = bench();
        booted(&b);
        let system_task = b.rtos.last_spawn().unwrap().id;

        fn start_simple(_recognizer: ClickRecognizerRef, context: *mut ()) {
            let mgr: &'static AppManager = unsafe { &*(context as *const AppManager) };
            let _ = mgr.start("Simple");
        }
        b.mgr
            .post_button_message(ButtonMessage {
                callback: start_simple,
                clickref: ClickRecognizerRef(0),
                context: b.mgr as *const AppManager as *mut (),
            })
            .unwrap();

        // the guest runs the button callback, then honors the quit the
        // start queued behind it
        b.mgr.app_event_loop();
        assert!(b.rtos.deleted.lock().unwrap().contains(&system_task));

        b.mgr.controller_step();
        let guest = b.rtos.last_spawn().unwrap();
        assert_eq!(guest.entry_addr, crate::apps::simple::main as usize);
        assert_eq!(b.mgr.running_app().unwrap().app_type, AppType::Face);
        assert_eq!(b.rtos.live_count("dynapp"), 1);

        // a face's pump installs the select handler that leads back home
        b.mgr.quit().unwrap();
        b.mgr.app_event_loop();
        assert!(b.window.select_was_subscribed());
    }

    #[test]
    fn missing_app_leaves_the_system_without_a_guest() {
        let b = bench();
        booted(&b);

        b.mgr.start("NoSuch").unwrap();
        // the running guest honors its quit before the controller acts
        b.mgr.app_event_loop();
        assert_eq!(b.rtos.live_count("dynapp"), 0);

        b.mgr.controller_step();
        assert_eq!(b.rtos.live_count("dynapp"), 0);
        assert_eq!(b.mgr.running_app().unwrap().name, "System");

        // the next successful start recovers
        b.mgr.start("Simple").unwrap();
        b.mgr.controller_step();
        assert_eq!(b.rtos.live_count("dynapp"), 1);
        assert_eq!(b.mgr.running_app().unwrap().name, "Simple");
    }

    #[test]
    fn stale_events_never_reach_the_new_app() {
        static DELIVERED: AtomicUsize = AtomicUsize::new(0);
        fn record(_recognizer: ClickRecognizerRef, _context: *mut ()) {
            DELIVERED.fetch_add(1, AtomicOrdering::Relaxed);
        }

        let b = bench();
        booted(&b);
        let system_task = b.rtos.last_spawn().unwrap().id;

        for _ in 0..2 {
            b.mgr
                .post_button_message(ButtonMessage {
                    callback: record,
                    clickref: ClickRecognizerRef(0),
                    context: core::ptr::null_mut(),
                })
                .unwrap();
        }

        // the guest never drains its queue; the controller force-deletes
        b.mgr.start("Simple").unwrap();
        b.mgr.controller_step();
        assert!(b.rtos.deleted.lock().unwrap().contains(&system_task));
        assert_eq!(b.rtos.live_count("dynapp"), 1);

        b.mgr.quit().unwrap();
        b.mgr.app_event_loop();
        assert_eq!(DELIVERED.load(AtomicOrdering::Relaxed), 0);
    }

    #[test]
    fn isr_tick_burst_is_bounded_and_ordered() {
        static TICKS: StdMutex<Vec<u32>> = StdMutex::new(Vec::new());
        static MGR: OnceLock<&'static AppManager> = OnceLock::new();
        fn on_tick(time: TickTime, _units: TimeUnits) {
            let seen = {
                let mut ticks = TICKS.lock().unwrap();
                ticks.push(time);
                ticks.len()
            };
            if seen == 5 {
                let _ = MGR.get().unwrap().quit();
            }
        }

        let b = bench();
        MGR.set(b.mgr).ok();
        booted(&b);

        let mut woken = false;
        let mut accepted = 0;
        for i in 0..10u32 {
            let message = TickMessage {
                callback: on_tick,
                tick_time: i,
                tick_units: TimeUnits::SECOND,
            };
            if b.mgr.post_tick_message(message, &mut woken).is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 5);

        b.mgr.app_event_loop();
        assert_eq!(*TICKS.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn failed_flash_start_keeps_the_prior_app() {
        let mut flash = MemFlash::blank();
        let body = vec![0u8; 0x100];
        flash.program_slot(
            4,
            &packed_slot(&face_header("Goliath", MAX_APP_MEMORY_SIZE as u32), &body, &[]),
        );
        let b = bench_with_flash(flash);
        booted(&b);

        b.mgr.start("Goliath").unwrap();
        b.mgr.app_event_loop();
        b.mgr.controller_step();

        assert_eq!(b.rtos.live_count("dynapp"), 0);
        assert_eq!(b.mgr.running_app().unwrap().name, "System");
    }

    #[test]
    fn flash_app_spawns_at_the_relocated_entry() {
        let mut flash = MemFlash::blank();
        let body = vec![0u8; 0x100];
        flash.program_slot(5, &packed_slot(&face_header("Tempus", 0x180), &body, &[]));
        let b = bench_with_flash(flash);
        booted(&b);

        b.mgr.start("Tempus").unwrap();
        b.mgr.app_event_loop();
        b.mgr.controller_step();

        let guest = b.rtos.last_spawn().unwrap();
        assert!(!guest.is_internal);
        assert_eq!(b.rtos.live_count("dynapp"), 1);
        let record = b.mgr.running_app().unwrap();
        assert_eq!(record.name, "Tempus");
        assert_eq!(record.slot_id, 5);

        let TaskStack::Arena(stack) = guest.stack else {
            panic!("guest stack must come from the arena");
        };
        let arena_base = stack.base + stack.words * 4 - MAX_APP_MEMORY_SIZE;
        assert_eq!(guest.entry_addr, arena_base + 0x20);

        // proxies capture the running app's slot at call time
        assert_eq!(b.mgr.resource_get_handle(7).unwrap().0, (7 << 8) | 5);
        assert_eq!(b.mgr.bitmap_with_resource(9).unwrap().0, (9 << 8) | 5);
    }

    #[test]
    fn scan_skips_bad_magic_and_bad_crc_slots() {
        let mut flash = MemFlash::blank();
        let body = vec![0xABu8; 0x80];
        flash.program_slot(2, &packed_slot(&face_header("Good", 0x80), &body, &[]));
        let mut corrupt = packed_slot(&face_header("Evil", 0x80), &body, &[]);
        corrupt[proto::HEADER_SIZE] ^= 0x01;
        flash.program_slot(7, &corrupt);
        flash.program_slot(9, b"JUNKJUNKJUNK");

        let b = bench_with_flash(flash);
        assert_eq!(b.mgr.manifest().len(), 4);
        let good = b.mgr.manifest().lookup("Good").unwrap();
        assert!(!good.is_internal);
        assert_eq!(good.slot_id, 2);
        assert!(good.header.is_some());
        assert!(b.mgr.manifest().lookup("Evil").is_none());
        assert_eq!(b.mgr.apps_head().unwrap().name, "System");
    }
}
