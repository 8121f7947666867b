//! Input device processors.
//!
//! One processor exists per device a seat exposes. Processors translate raw
//! protocol events into the portable types of [`crate::event`] and post them
//! through the event loop handle; they never deliver anything to the
//! application directly.

pub mod keyboard;
pub mod pointer;
