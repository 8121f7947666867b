//! Keyboard event translation and key repeat.
//!
//! The compositor only reports physical presses and releases; repeats are
//! synthesized client side. A held key arms a repeat timer that emits a
//! release/press pair of the translated symbol until the physical release
//! (or focus loss) cancels it.

use std::fmt;
use std::os::fd::OwnedFd;
use std::time::Duration;

use tracing::{debug, error, warn};
use wayland_client::protocol::wl_keyboard::{KeymapFormat, WlKeyboard};
use wayland_client::{Proxy, WEnum};

use crate::event::Event;
use crate::event_loop::{EventLoopHandle, TimerHandle};
use crate::keymap::Keymap;

const DEFAULT_REPEAT_DELAY: Duration = Duration::from_millis(1000);
const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_millis(250);

enum KeymapSlot {
    /// No keymap event has arrived yet.
    Missing,
    /// A keymap arrived but was unusable; the processor stays disabled.
    Failed,
    Ready(Keymap),
}

impl fmt::Debug for KeymapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeymapSlot::Missing => f.write_str("Missing"),
            KeymapSlot::Failed => f.write_str("Failed"),
            KeymapSlot::Ready(_) => f.write_str("Ready"),
        }
    }
}

struct ActiveRepeat {
    scancode: u32,
    // Dropping the handle cancels the timer.
    _timer: TimerHandle,
}

/// Translation and repeat state, independent of the wire.
pub(crate) struct KeyboardLogic {
    keymap: KeymapSlot,
    handle: EventLoopHandle,
    repeat_delay: Duration,
    /// `None` when the compositor disabled repeat via `repeat_info`.
    repeat_interval: Option<Duration>,
    repeat: Option<ActiveRepeat>,
}

impl fmt::Debug for KeyboardLogic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyboardLogic")
            .field("keymap", &self.keymap)
            .field("repeat_delay", &self.repeat_delay)
            .field("repeat_interval", &self.repeat_interval)
            .field("repeating", &self.repeat.as_ref().map(|r| r.scancode))
            .finish_non_exhaustive()
    }
}

impl KeyboardLogic {
    pub(crate) fn new(handle: EventLoopHandle) -> KeyboardLogic {
        KeyboardLogic {
            keymap: KeymapSlot::Missing,
            handle,
            repeat_delay: DEFAULT_REPEAT_DELAY,
            repeat_interval: Some(DEFAULT_REPEAT_INTERVAL),
            repeat: None,
        }
    }

    pub(crate) fn keymap_installed(&mut self, keymap: Keymap) {
        debug!("keymap installed");
        self.keymap = KeymapSlot::Ready(keymap);
    }

    pub(crate) fn keymap_failed(&mut self) {
        self.keymap = KeymapSlot::Failed;
        self.repeat = None;
    }

    pub(crate) fn on_enter(&mut self) {
        debug!("keyboard focus gained");
        self.handle.post_focus_change(true);
    }

    pub(crate) fn on_leave(&mut self) {
        debug!("keyboard focus lost");
        // Releases are not delivered for keys held across a focus loss.
        self.repeat = None;
        self.handle.post_focus_change(false);
    }

    pub(crate) fn on_modifiers(&mut self, depressed: u32, latched: u32, locked: u32, group: u32) {
        match &mut self.keymap {
            KeymapSlot::Ready(keymap) => keymap.update_modifiers(depressed, latched, locked, group),
            _ => warn!("modifier update before a usable keymap, ignored"),
        }
    }

    pub(crate) fn on_repeat_info(&mut self, rate: i32, delay: i32) {
        debug!(rate, delay, "compositor adjusted key repeat");
        if rate <= 0 {
            self.repeat_interval = None;
            self.repeat = None;
        } else {
            self.repeat_interval = Some(Duration::from_secs_f64(1.0 / rate as f64));
        }
        self.repeat_delay = Duration::from_millis(delay.max(0) as u64);
    }

    /// Translates and delivers a physical key event.
    ///
    /// # Panics
    ///
    /// Panics if no keymap event was ever received; the protocol guarantees
    /// the keymap precedes any key, so this is a dispatch-order bug.
    pub(crate) fn on_key(&mut self, time: u32, scancode: u32, pressed: bool) {
        let keymap = match &self.keymap {
            KeymapSlot::Ready(keymap) => keymap,
            KeymapSlot::Missing => panic!("key event received before any keymap was announced"),
            KeymapSlot::Failed => {
                debug!(scancode, "dropping key event, keyboard has no usable keymap");
                return;
            }
        };

        let Some(key) = keymap.key(scancode) else {
            warn!(
                scancode,
                sym = keymap.key_name(scancode),
                "dropping key with no portable symbol"
            );
            return;
        };
        let mods = keymap.modifiers();
        let repeats = keymap.repeats(scancode);

        self.handle.post_event(Event::Key {
            key,
            mods,
            scancode,
            pressed,
            time,
        });

        if pressed {
            self.repeat = None;
            if repeats {
                if let Some(interval) = self.repeat_interval {
                    let handle = self.handle.clone();
                    let timer = self.handle.add_timer(
                        self.repeat_delay,
                        interval,
                        Box::new(move || {
                            handle.post_event(Event::Key {
                                key,
                                mods,
                                scancode,
                                pressed: false,
                                time,
                            });
                            handle.post_event(Event::Key {
                                key,
                                mods,
                                scancode,
                                pressed: true,
                                time,
                            });
                        }),
                    );
                    self.repeat = Some(ActiveRepeat {
                        scancode,
                        _timer: timer,
                    });
                }
            }
        } else if self.repeat.as_ref().is_some_and(|r| r.scancode == scancode) {
            self.repeat = None;
        }
    }
}

/// Processor for one `wl_keyboard` device.
///
/// Releases the device on drop.
#[derive(Debug)]
pub struct Keyboard {
    keyboard: WlKeyboard,
    logic: KeyboardLogic,
}

impl Keyboard {
    pub(crate) fn new(keyboard: WlKeyboard, handle: EventLoopHandle) -> Keyboard {
        Keyboard {
            keyboard,
            logic: KeyboardLogic::new(handle),
        }
    }

    /// Compiles the announced keymap. The descriptor is consumed on every
    /// path; it belongs to the compositor.
    pub(crate) fn on_keymap(&mut self, format: WEnum<KeymapFormat>, fd: OwnedFd, size: u32) {
        match format {
            WEnum::Value(KeymapFormat::XkbV1) => match Keymap::from_fd(fd, size as usize) {
                Ok(keymap) => self.logic.keymap_installed(keymap),
                Err(err) => {
                    error!("could not compile the announced keymap: {err}");
                    self.logic.keymap_failed();
                }
            },
            other => {
                error!(?other, "unsupported keymap format, disabling keyboard");
                self.logic.keymap_failed();
            }
        }
    }

    pub(crate) fn logic(&mut self) -> &mut KeyboardLogic {
        &mut self.logic
    }
}

impl Drop for Keyboard {
    fn drop(&mut self) {
        if self.keyboard.version() >= 3 {
            self.keyboard.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventSink, Key};
    use crate::keymap::test_keymap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
        focus: Mutex<Vec<bool>>,
    }

    impl EventSink for RecordingSink {
        fn event(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
        fn focus_changed(&self, focused: bool) {
            self.focus.lock().unwrap().push(focused);
        }
    }

    fn logic_with_keymap() -> (KeyboardLogic, Arc<RecordingSink>, EventLoopHandle) {
        crate::init_test_logging();
        let sink = Arc::new(RecordingSink::default());
        let handle = EventLoopHandle::new_immediate(sink.clone());
        let mut logic = KeyboardLogic::new(handle.clone());
        logic.keymap_installed(test_keymap());
        (logic, sink, handle)
    }

    fn presses(sink: &RecordingSink) -> Vec<(Key, bool)> {
        sink.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Key { key, pressed, .. } => Some((*key, *pressed)),
                _ => None,
            })
            .collect()
    }

    const SC_A: u32 = 30;

    #[test]
    fn held_key_repeats_after_delay_then_at_interval() {
        let (mut logic, sink, handle) = logic_with_keymap();

        logic.on_key(100, SC_A, true);
        assert_eq!(presses(&sink), vec![(Key::Char('a'), true)]);

        handle.tick_timers(Duration::from_millis(1000));
        assert_eq!(
            presses(&sink),
            vec![
                (Key::Char('a'), true),
                (Key::Char('a'), false),
                (Key::Char('a'), true),
            ]
        );

        handle.tick_timers(Duration::from_millis(250));
        assert_eq!(presses(&sink).len(), 5);
    }

    #[test]
    fn release_before_the_delay_cancels_the_repeat() {
        let (mut logic, sink, handle) = logic_with_keymap();

        logic.on_key(100, SC_A, true);
        handle.tick_timers(Duration::from_millis(500));
        logic.on_key(600, SC_A, false);
        handle.tick_timers(Duration::from_millis(5000));

        assert_eq!(
            presses(&sink),
            vec![(Key::Char('a'), true), (Key::Char('a'), false)]
        );
    }

    #[test]
    fn focus_loss_cancels_the_repeat() {
        let (mut logic, sink, handle) = logic_with_keymap();

        logic.on_key(100, SC_A, true);
        logic.on_leave();
        handle.tick_timers(Duration::from_millis(5000));

        assert_eq!(presses(&sink), vec![(Key::Char('a'), true)]);
        assert_eq!(*sink.focus.lock().unwrap(), vec![false]);
    }

    #[test]
    fn repeat_info_rate_zero_disables_repeat() {
        let (mut logic, sink, handle) = logic_with_keymap();

        logic.on_repeat_info(0, 500);
        logic.on_key(100, SC_A, true);
        handle.tick_timers(Duration::from_millis(10_000));

        assert_eq!(presses(&sink), vec![(Key::Char('a'), true)]);
    }

    #[test]
    fn repeat_info_overrides_the_default_timings() {
        let (mut logic, sink, handle) = logic_with_keymap();

        // 25 repeats per second after 300 ms.
        logic.on_repeat_info(25, 300);
        logic.on_key(100, SC_A, true);

        handle.tick_timers(Duration::from_millis(299));
        assert_eq!(presses(&sink).len(), 1);
        handle.tick_timers(Duration::from_millis(1));
        assert_eq!(presses(&sink).len(), 3);
        handle.tick_timers(Duration::from_millis(40));
        assert_eq!(presses(&sink).len(), 5);
    }

    #[test]
    fn modifier_update_precedes_the_following_key() {
        let (mut logic, sink, _handle) = logic_with_keymap();

        // Shift is modifier index 0 in the compiled test keymap.
        logic.on_modifiers(1, 0, 0, 0);
        logic.on_key(100, SC_A, true);

        let events = sink.events.lock().unwrap();
        match &events[0] {
            Event::Key { key, mods, .. } => {
                assert_eq!(*key, Key::Char('A'));
                assert!(mods.shift);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unmapped_scancode_is_dropped_not_delivered() {
        let (mut logic, sink, _handle) = logic_with_keymap();
        logic.on_key(100, 200, true);
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "before any keymap")]
    fn key_before_keymap_panics() {
        let sink = Arc::new(RecordingSink::default());
        let handle = EventLoopHandle::new_immediate(sink);
        let mut logic = KeyboardLogic::new(handle);
        logic.on_key(100, SC_A, true);
    }

    #[test]
    fn unusable_keymap_disables_instead_of_panicking() {
        let sink = Arc::new(RecordingSink::default());
        let handle = EventLoopHandle::new_immediate(sink.clone());
        let mut logic = KeyboardLogic::new(handle);
        logic.keymap_failed();
        logic.on_key(100, SC_A, true);
        assert!(sink.events.lock().unwrap().is_empty());
    }
}
