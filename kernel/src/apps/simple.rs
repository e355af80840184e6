//! Minimal built-in watchface.

use log::info;

use crate::app::AppManager;

pub fn main(mgr: &'static AppManager) {
    info!("app: simple face");
    mgr.app_event_loop();
}
