//! Pointer event translation.

use std::fmt;

use tracing::{debug, trace};
use wayland_client::protocol::wl_pointer::WlPointer;
use wayland_client::Proxy;

use crate::event::{Button, Event};
use crate::event_loop::EventLoopHandle;

// Linux input-event button codes as delivered in wl_pointer.button.
const BTN_LEFT: u32 = 0x110;
const BTN_RIGHT: u32 = 0x111;
const BTN_MIDDLE: u32 = 0x112;

fn translate_button(code: u32) -> Option<Button> {
    match code {
        BTN_LEFT => Some(Button::Left),
        BTN_RIGHT => Some(Button::Right),
        BTN_MIDDLE => Some(Button::Middle),
        _ => None,
    }
}

/// Position tracking and event translation, independent of the wire.
#[derive(Debug, Default)]
pub(crate) struct PointerLogic {
    x: f64,
    y: f64,
}

impl PointerLogic {
    fn enter(&mut self, x: f64, y: f64) -> Event {
        self.x = x;
        self.y = y;
        Event::PointerEntered
    }

    fn motion(&mut self, time: u32, x: f64, y: f64) -> Event {
        self.x = x;
        self.y = y;
        Event::Motion { x, y, time }
    }

    /// Unknown button codes translate to nothing and are dropped.
    fn button(&self, time: u32, code: u32, pressed: bool) -> Option<Event> {
        let button = translate_button(code)?;
        Some(Event::Button {
            button,
            pressed,
            x: self.x,
            y: self.y,
            time,
        })
    }

    /// Vertical scroll becomes a synthetic press/release pair; the wheel has
    /// no concept of "held", so both halves are emitted at once. Magnitude
    /// is discarded, only the sign selects the direction. Horizontal scroll
    /// has no portable representation and translates to nothing.
    fn axis(&self, time: u32, vertical: bool, value: f64) -> Vec<Event> {
        if !vertical || value == 0.0 {
            return Vec::new();
        }
        let button = if value < 0.0 { Button::WheelUp } else { Button::WheelDown };
        vec![
            Event::Button {
                button,
                pressed: true,
                x: self.x,
                y: self.y,
                time,
            },
            Event::Button {
                button,
                pressed: false,
                x: self.x,
                y: self.y,
                time,
            },
        ]
    }
}

/// Processor for one `wl_pointer` device.
///
/// Releases the device on drop.
pub struct Pointer {
    pointer: WlPointer,
    logic: PointerLogic,
    handle: EventLoopHandle,
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pointer")
            .field("id", &self.pointer.id())
            .field("logic", &self.logic)
            .finish_non_exhaustive()
    }
}

impl Pointer {
    pub(crate) fn new(pointer: WlPointer, handle: EventLoopHandle) -> Pointer {
        Pointer {
            pointer,
            logic: PointerLogic::default(),
            handle,
        }
    }

    /// The surface was entered. The application draws its own cursor, so
    /// the compositor's is hidden for as long as we have pointer focus.
    pub(crate) fn on_enter(&mut self, serial: u32, x: f64, y: f64) {
        debug!("pointer entered surface");
        self.pointer.set_cursor(serial, None, 0, 0);
        let event = self.logic.enter(x, y);
        self.handle.post_event(event);
    }

    pub(crate) fn on_leave(&mut self) {
        debug!("pointer left surface");
        self.handle.post_event(Event::PointerLeft);
    }

    pub(crate) fn on_motion(&mut self, time: u32, x: f64, y: f64) {
        self.handle.post_event(self.logic.motion(time, x, y));
    }

    pub(crate) fn on_button(&mut self, time: u32, code: u32, pressed: bool) {
        match self.logic.button(time, code, pressed) {
            Some(event) => self.handle.post_event(event),
            None => trace!(code, "dropping unmapped button code"),
        }
    }

    pub(crate) fn on_axis(&mut self, time: u32, vertical: bool, value: f64) {
        for event in self.logic.axis(time, vertical, value) {
            self.handle.post_event(event);
        }
    }
}

impl Drop for Pointer {
    fn drop(&mut self) {
        if self.pointer.version() >= 3 {
            self.pointer.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buttons_are_stamped_with_the_last_known_position() {
        let mut logic = PointerLogic::default();
        logic.motion(10, 120.5, 64.25);
        let event = logic.button(11, BTN_LEFT, true).unwrap();
        assert_eq!(
            event,
            Event::Button {
                button: Button::Left,
                pressed: true,
                x: 120.5,
                y: 64.25,
                time: 11,
            }
        );
    }

    #[test]
    fn unknown_button_codes_are_dropped() {
        let logic = PointerLogic::default();
        // BTN_SIDE
        assert_eq!(logic.button(0, 0x113, true), None);
    }

    #[test]
    fn upward_scroll_emits_exactly_one_wheel_up_pair() {
        let logic = PointerLogic::default();
        let events = logic.axis(5, true, -2.5);
        let ups: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::Button { button: Button::WheelUp, pressed, .. } => Some(*pressed),
                _ => None,
            })
            .collect();
        assert_eq!(ups, vec![true, false]);
        assert!(!events.iter().any(|e| matches!(
            e,
            Event::Button { button: Button::WheelDown, .. }
        )));
    }

    #[test]
    fn downward_scroll_emits_a_wheel_down_pair() {
        let logic = PointerLogic::default();
        let events = logic.axis(5, true, 1.0);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(
            e,
            Event::Button { button: Button::WheelDown, .. }
        )));
    }

    #[test]
    fn horizontal_scroll_translates_to_nothing() {
        let logic = PointerLogic::default();
        assert!(logic.axis(5, false, 3.0).is_empty());
    }
}
