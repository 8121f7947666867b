//! Seat handling: one wrapper per advertised `wl_seat` global.
//!
//! The capability bitmask drives the lifetime of the input processors: a
//! capability appearing creates the matching processor, a capability
//! disappearing (or the whole seat being withdrawn) drops it, which releases
//! the protocol object.

use std::fmt;

use tracing::info;
use wayland_client::protocol::wl_keyboard::WlKeyboard;
use wayland_client::protocol::wl_pointer::WlPointer;
use wayland_client::protocol::wl_seat::{Capability, WlSeat};
use wayland_client::{Dispatch, Proxy, QueueHandle};

use crate::event_loop::EventLoopHandle;
use crate::input::keyboard::Keyboard;
use crate::input::pointer::Pointer;

/// User data tying a seat's device proxies back to the seat they belong to,
/// keyed by the seat's registry name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeatData(pub u32);

/// A bound `wl_seat` global and the processors for its devices.
pub struct Seat {
    seat: WlSeat,
    registry_name: u32,
    name: String,
    pointer: Option<Pointer>,
    keyboard: Option<Keyboard>,
    handle: EventLoopHandle,
}

impl fmt::Debug for Seat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seat")
            .field("registry_name", &self.registry_name)
            .field("name", &self.name)
            .field("has_pointer", &self.pointer.is_some())
            .field("has_keyboard", &self.keyboard.is_some())
            .finish_non_exhaustive()
    }
}

impl Seat {
    pub(crate) fn new(seat: WlSeat, registry_name: u32, handle: EventLoopHandle) -> Seat {
        Seat {
            seat,
            registry_name,
            name: String::new(),
            pointer: None,
            keyboard: None,
            handle,
        }
    }

    /// The registry name this seat was advertised under.
    pub fn registry_name(&self) -> u32 {
        self.registry_name
    }

    /// The seat name announced by the compositor, empty until the `name`
    /// event arrives (seat version 2+).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    /// Reconciles the processors with a new capability bitmask.
    pub(crate) fn update_capabilities<S>(&mut self, capabilities: Capability, qh: &QueueHandle<S>)
    where
        S: Dispatch<WlPointer, SeatData> + Dispatch<WlKeyboard, SeatData> + 'static,
    {
        let data = SeatData(self.registry_name);

        if capabilities.contains(Capability::Pointer) && self.pointer.is_none() {
            info!(seat = %self.name, "seat gained pointer capability");
            let pointer = self.seat.get_pointer(qh, data);
            self.pointer = Some(Pointer::new(pointer, self.handle.clone()));
        } else if !capabilities.contains(Capability::Pointer) && self.pointer.is_some() {
            info!(seat = %self.name, "seat lost pointer capability");
            self.pointer = None;
        }

        if capabilities.contains(Capability::Keyboard) && self.keyboard.is_none() {
            info!(seat = %self.name, "seat gained keyboard capability");
            let keyboard = self.seat.get_keyboard(qh, data);
            self.keyboard = Some(Keyboard::new(keyboard, self.handle.clone()));
        } else if !capabilities.contains(Capability::Keyboard) && self.keyboard.is_some() {
            info!(seat = %self.name, "seat lost keyboard capability");
            self.keyboard = None;
        }
    }

    pub(crate) fn pointer_mut(&mut self) -> Option<&mut Pointer> {
        self.pointer.as_mut()
    }

    pub(crate) fn keyboard_mut(&mut self) -> Option<&mut Keyboard> {
        self.keyboard.as_mut()
    }
}

impl Drop for Seat {
    fn drop(&mut self) {
        info!(seat = %self.name, "removing seat");
        // Processors release their devices before the seat itself goes.
        self.pointer = None;
        self.keyboard = None;
        if self.seat.version() >= 5 {
            self.seat.release();
        }
    }
}
