//! Portable input and window events delivered to the application.
//!
//! Everything the protocol layer produces is translated into the types in
//! this module before it crosses the boundary to the application. Delivery
//! always happens through [`EventLoop::dispatch`](crate::event_loop::EventLoop::dispatch)
//! on the thread that calls it, regardless of which thread read the wire.

use std::fmt;

/// Portable mouse button identifiers.
///
/// Wheel movement is reported as a synthetic press/release pair of
/// [`Button::WheelUp`] or [`Button::WheelDown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    /// Left mouse button.
    Left,
    /// Middle mouse button (wheel click).
    Middle,
    /// Right mouse button.
    Right,
    /// Virtual button for one notch of upward vertical scroll.
    WheelUp,
    /// Virtual button for one notch of downward vertical scroll.
    WheelDown,
}

/// Snapshot of the active keyboard modifiers at the time of an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Modifiers {
    /// The "control" key
    pub ctrl: bool,
    /// The "alt" key
    pub alt: bool,
    /// The "shift" key
    pub shift: bool,
    /// The "logo" key, also known as the "windows" key
    pub logo: bool,
    /// The "caps lock" toggle
    pub caps_lock: bool,
    /// The "num lock" toggle
    pub num_lock: bool,
}

/// Portable key symbols.
///
/// Printable keys are reported as [`Key::Char`] with the character produced
/// under the active keymap and modifier state. Editing, navigation, function
/// and media keys get named variants. Keycodes that translate to none of
/// these are dropped by the keyboard processor (with a log message), they are
/// never delivered as a placeholder value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Key {
    /// A printable character under the active keymap.
    Char(char),
    Backspace,
    Tab,
    Return,
    Escape,
    Delete,
    Insert,
    Home,
    End,
    PageUp,
    PageDown,
    Up,
    Down,
    Left,
    Right,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    F9,
    F10,
    F11,
    F12,
    /// Media key: toggle playback.
    PlayPause,
    /// Media key: stop playback.
    Stop,
    /// Media key: next track.
    NextTrack,
    /// Media key: previous track.
    PrevTrack,
    /// Media key: raise volume.
    VolumeUp,
    /// Media key: lower volume.
    VolumeDown,
    /// Media key: mute.
    Mute,
}

/// An event translated from the wire, ready for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The pointer moved to a new position in surface coordinates.
    Motion {
        /// Horizontal position in surface coordinates.
        x: f64,
        /// Vertical position in surface coordinates.
        y: f64,
        /// Compositor timestamp in milliseconds.
        time: u32,
    },
    /// A mouse button changed state. Synthetic wheel buttons arrive as a
    /// press immediately followed by a release.
    Button {
        /// Which button.
        button: Button,
        /// `true` for press, `false` for release.
        pressed: bool,
        /// Last known pointer position (button events carry no position on
        /// the wire).
        x: f64,
        /// See `x`.
        y: f64,
        /// Compositor timestamp in milliseconds.
        time: u32,
    },
    /// A key changed state.
    Key {
        /// Translated portable symbol.
        key: Key,
        /// Modifier snapshot taken after any modifier update that preceded
        /// this key in wire order.
        mods: Modifiers,
        /// Raw scancode as delivered by the compositor (evdev code, without
        /// the xkb offset).
        scancode: u32,
        /// `true` for press, `false` for release.
        pressed: bool,
        /// Compositor timestamp in milliseconds.
        time: u32,
    },
    /// The pointer entered the window surface.
    PointerEntered,
    /// The pointer left the window surface.
    PointerLeft,
    /// The compositor suggested a new surface size.
    Configure {
        /// Suggested width in surface coordinates, 0 if the compositor has
        /// no preference.
        width: i32,
        /// Suggested height, see `width`.
        height: i32,
    },
    /// The set of known outputs changed (hotplug, first advertisement).
    OutputsChanged,
    /// The preferred buffer scale for the window surface changed.
    ScaleChanged {
        /// New integer scale factor.
        scale: i32,
    },
}

/// Receiver for translated events, implemented by the application.
///
/// All methods are invoked from inside
/// [`EventLoop::dispatch`](crate::event_loop::EventLoop::dispatch), on the
/// thread that calls it.
pub trait EventSink: Send + Sync {
    /// An input or window event occurred.
    fn event(&self, event: Event);
    /// Keyboard focus was gained or lost.
    fn focus_changed(&self, focused: bool);
}

impl fmt::Debug for dyn EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSink { .. }")
    }
}
