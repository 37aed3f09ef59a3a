//! Core utilities shared by every Gears crate.

pub mod collections;
pub mod event;
pub mod log;

pub use event::{Event, Subscription};
