//! Window/click collaborator contract and button event payloads.
//!
//! The window subsystem recognizes gestures and hands them up as
//! [`ButtonMessage`]s via `AppManager::post_button_message`; the event
//! pump invokes the carried callback on the guest task.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ButtonId {
    Back,
    Up,
    Select,
    Down,
}

/// Opaque recognizer token the window subsystem passes back to click
/// callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClickRecognizerRef(pub usize);

pub type ClickHandler = fn(ClickRecognizerRef, *mut ());

/// One recognized gesture. `context` is whatever pointer was registered
/// with the subscription.
#[derive(Clone, Copy)]
pub struct ButtonMessage {
    pub callback: ClickHandler,
    pub clickref: ClickRecognizerRef,
    pub context: *mut (),
}

// `context` is produced by the subscribing task and dereferenced only by
// the guest task the pump runs on; the queue just carries it across.
unsafe impl Send for ButtonMessage {}

pub trait WindowPort: Send + Sync {
    /// Run the current window's load hook.
    fn load_window_proc(&self);

    /// Apply the current window's click configuration.
    fn load_click_config(&self);

    fn single_click_subscribe(&self, button: ButtonId, handler: ClickHandler, context: *mut ());

    /// `delay_ms` is how long the button must be held before the handler
    /// fires.
    fn long_click_subscribe(
        &self,
        button: ButtonId,
        delay_ms: u32,
        handler: ClickHandler,
        context: *mut (),
    );

    fn button_unsubscribe_all(&self);

    fn tick_service_unsubscribe(&self);

    /// Request a redraw of the current window.
    fn mark_dirty(&self);
}
