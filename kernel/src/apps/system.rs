//! The system app: a menu over everything the manifest knows.

use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info};

use crate::app::AppManager;

static MENU_CURSOR: AtomicUsize = AtomicUsize::new(0);

pub fn main(mgr: &'static AppManager) {
    info!("app: system menu");
    for record in mgr.manifest().iter() {
        debug!("app:   {} ({:?})", record.name, record.app_type);
    }
    mgr.app_event_loop();
}

/// Select pressed while the menu is up: launch the entry under the
/// cursor and advance it, so repeated selects cycle the manifest.
pub fn menu_select(mgr: &'static AppManager) {
    let len = mgr.manifest().len();
    if len == 0 {
        return;
    }
    let index = MENU_CURSOR.fetch_add(1, Ordering::Relaxed) % len;
    if let Some(record) = mgr.manifest().get(index) {
        let name = record.name.clone();
        let _ = mgr.start(&name);
    }
}
