//! Slot-addressed resource lookups.
//!
//! Resources live next to the app that owns them, so every lookup needs
//! the owning flash slot. Guests never know their slot; the manager's
//! proxy methods capture the running app's slot at call time and forward
//! here.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitmapHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FontHandle(pub u32);

pub trait ResourceStore: Send + Sync {
    fn bitmap(&self, resource_id: u32, slot: u8) -> Option<BitmapHandle>;

    fn handle(&self, resource_id: u16, slot: u8) -> Option<ResHandle>;

    fn custom_font(&self, handle: ResHandle, slot: u8) -> Option<FontHandle>;
}
