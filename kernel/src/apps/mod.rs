//! Built-in applications, host-linked and spawned without the loader.

pub mod nivz;
pub mod simple;
pub mod system;
