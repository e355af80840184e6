//! Tick-service event payloads.

use bitflags::bitflags;

bitflags! {
    /// Calendar units a tick subscriber asked to be woken for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TimeUnits: u32 {
        const SECOND = 1 << 0;
        const MINUTE = 1 << 1;
        const HOUR = 1 << 2;
        const DAY = 1 << 3;
        const MONTH = 1 << 4;
        const YEAR = 1 << 5;
    }
}

/// Wall-clock seconds, as the tick service reports them.
pub type TickTime = u32;

pub type TickHandler = fn(TickTime, TimeUnits);

/// One tick event, posted from the timer ISR.
#[derive(Clone, Copy)]
pub struct TickMessage {
    pub callback: TickHandler,
    pub tick_time: TickTime,
    pub tick_units: TimeUnits,
}
