//! Keymap compilation and keycode translation.
//!
//! Wraps a compiled xkb keymap together with its live modifier/group state.
//! One [`Keymap`] belongs to exactly one keyboard device; the owning keyboard
//! processor feeds modifier updates into it in wire order, so a lookup always
//! sees the modifier state that preceded the key on the wire.

use std::fmt;
use std::os::fd::OwnedFd;

use thiserror::Error;
use xkbcommon::xkb;
use xkbcommon::xkb::{keysyms, Keycode, Keysym};

use crate::event::{Key, Modifiers};

/// Offset between evdev scancodes (as sent by the compositor) and xkb
/// keycodes.
const EVDEV_OFFSET: u32 = 8;

/// Errors compiling a keymap received from the compositor.
#[derive(Debug, Error)]
pub enum KeymapError {
    /// The mapped keymap text could not be compiled.
    #[error("could not compile keymap")]
    Compile,
    /// The keymap file descriptor could not be mapped and read.
    #[error("could not read keymap: {0}")]
    Read(#[from] std::io::Error),
}

/// A compiled keymap plus live modifier/group state for one keyboard.
pub struct Keymap {
    // Context is kept alive for the lifetime of the keymap, even though no
    // further compilation happens.
    _context: xkb::Context,
    keymap: xkb::Keymap,
    state: xkb::State,
}

// We create a new context per keyboard because libxkbcommon is not
// threadsafe. The whole triple stays confined behind the keyboard processor,
// which is only ever driven by one thread at a time, so no ref-count is
// shared across threads.
unsafe impl Send for Keymap {}

impl fmt::Debug for Keymap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keymap")
            .field("keymap", &self.keymap.get_raw_ptr())
            .field("state", &self.state.get_raw_ptr())
            .finish()
    }
}

impl Keymap {
    /// Compiles a keymap from the shared-memory descriptor announced by the
    /// compositor.
    ///
    /// The descriptor is consumed and closed on every path, it belongs to
    /// the compositor and must not be kept open.
    pub fn from_fd(fd: OwnedFd, size: usize) -> Result<Keymap, KeymapError> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = unsafe {
            xkb::Keymap::new_from_fd(
                &context,
                fd,
                size,
                xkb::KEYMAP_FORMAT_TEXT_V1,
                xkb::KEYMAP_COMPILE_NO_FLAGS,
            )
        }?
        .ok_or(KeymapError::Compile)?;
        let state = xkb::State::new(&keymap);
        Ok(Keymap {
            _context: context,
            keymap,
            state,
        })
    }

    /// Compiles a keymap from its textual form.
    pub fn from_string(text: &str) -> Result<Keymap, KeymapError> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = xkb::Keymap::new_from_string(
            &context,
            text.to_owned(),
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or(KeymapError::Compile)?;
        let state = xkb::State::new(&keymap);
        Ok(Keymap {
            _context: context,
            keymap,
            state,
        })
    }

    /// Applies a modifier/group update announced by the compositor.
    ///
    /// Must be called before any key lookup that followed the update in wire
    /// order, otherwise lookups report stale modifier masks.
    pub fn update_modifiers(&mut self, depressed: u32, latched: u32, locked: u32, group: u32) {
        self.state.update_mask(depressed, latched, locked, 0, 0, group);
    }

    /// Translates an evdev scancode into a portable key symbol under the
    /// current keymap and modifier state.
    ///
    /// Returns `None` for keycodes that produce no symbol or a symbol with
    /// no portable representation.
    pub fn key(&self, scancode: u32) -> Option<Key> {
        let keycode = Keycode::new(scancode + EVDEV_OFFSET);
        let sym = self.state.key_get_one_sym(keycode);
        translate_sym(sym)
    }

    /// Whether holding the key should generate repeats. Modifier and lock
    /// keys do not repeat.
    pub fn repeats(&self, scancode: u32) -> bool {
        self.keymap.key_repeats(Keycode::new(scancode + EVDEV_OFFSET))
    }

    /// Human readable name of the symbol a scancode currently produces, for
    /// diagnostics.
    pub fn key_name(&self, scancode: u32) -> String {
        let keycode = Keycode::new(scancode + EVDEV_OFFSET);
        xkb::keysym_get_name(self.state.key_get_one_sym(keycode))
    }

    /// Snapshot of the currently active modifiers.
    pub fn modifiers(&self) -> Modifiers {
        let state = &self.state;
        Modifiers {
            ctrl: state.mod_name_is_active(xkb::MOD_NAME_CTRL, xkb::STATE_MODS_EFFECTIVE),
            alt: state.mod_name_is_active(xkb::MOD_NAME_ALT, xkb::STATE_MODS_EFFECTIVE),
            shift: state.mod_name_is_active(xkb::MOD_NAME_SHIFT, xkb::STATE_MODS_EFFECTIVE),
            logo: state.mod_name_is_active(xkb::MOD_NAME_LOGO, xkb::STATE_MODS_EFFECTIVE),
            caps_lock: state.mod_name_is_active(xkb::MOD_NAME_CAPS, xkb::STATE_MODS_EFFECTIVE),
            num_lock: state.mod_name_is_active(xkb::MOD_NAME_NUM, xkb::STATE_MODS_EFFECTIVE),
        }
    }
}

fn translate_sym(sym: Keysym) -> Option<Key> {
    let named = match sym.raw() {
        keysyms::KEY_BackSpace => Some(Key::Backspace),
        keysyms::KEY_Tab => Some(Key::Tab),
        keysyms::KEY_Return | keysyms::KEY_KP_Enter => Some(Key::Return),
        keysyms::KEY_Escape => Some(Key::Escape),
        keysyms::KEY_Delete => Some(Key::Delete),
        keysyms::KEY_Insert => Some(Key::Insert),
        keysyms::KEY_Home => Some(Key::Home),
        keysyms::KEY_End => Some(Key::End),
        keysyms::KEY_Page_Up => Some(Key::PageUp),
        keysyms::KEY_Page_Down => Some(Key::PageDown),
        keysyms::KEY_Up => Some(Key::Up),
        keysyms::KEY_Down => Some(Key::Down),
        keysyms::KEY_Left => Some(Key::Left),
        keysyms::KEY_Right => Some(Key::Right),
        keysyms::KEY_F1 => Some(Key::F1),
        keysyms::KEY_F2 => Some(Key::F2),
        keysyms::KEY_F3 => Some(Key::F3),
        keysyms::KEY_F4 => Some(Key::F4),
        keysyms::KEY_F5 => Some(Key::F5),
        keysyms::KEY_F6 => Some(Key::F6),
        keysyms::KEY_F7 => Some(Key::F7),
        keysyms::KEY_F8 => Some(Key::F8),
        keysyms::KEY_F9 => Some(Key::F9),
        keysyms::KEY_F10 => Some(Key::F10),
        keysyms::KEY_F11 => Some(Key::F11),
        keysyms::KEY_F12 => Some(Key::F12),
        keysyms::KEY_XF86AudioPlay | keysyms::KEY_XF86AudioPause => Some(Key::PlayPause),
        keysyms::KEY_XF86AudioStop => Some(Key::Stop),
        keysyms::KEY_XF86AudioNext => Some(Key::NextTrack),
        keysyms::KEY_XF86AudioPrev => Some(Key::PrevTrack),
        keysyms::KEY_XF86AudioRaiseVolume => Some(Key::VolumeUp),
        keysyms::KEY_XF86AudioLowerVolume => Some(Key::VolumeDown),
        keysyms::KEY_XF86AudioMute => Some(Key::Mute),
        _ => None,
    };
    if named.is_some() {
        return named;
    }
    // Anything else is portable only if it produces a character.
    sym.key_char().map(Key::Char)
}

// Minimal us(basic)-style keymap, enough for letters, shift and a few named
// keys. Shared by the keyboard processor tests.
#[cfg(test)]
pub(crate) fn test_keymap() -> Keymap {
    let text = r#"xkb_keymap {
    xkb_keycodes {
        minimum = 8;
        maximum = 255;
        <ESC>  = 9;
        <AD01> = 24;
        <AC01> = 38;
        <RTRN> = 36;
        <LFSH> = 50;
        <UP>   = 111;
    };
    xkb_types {
        virtual_modifiers NumLock;
        type "ONE_LEVEL" {
            modifiers = none;
            level_name[Level1] = "Any";
        };
        type "TWO_LEVEL" {
            modifiers = Shift;
            map[Shift] = Level2;
            level_name[Level1] = "Base";
            level_name[Level2] = "Shift";
        };
    };
    xkb_compatibility {
        interpret Shift_L { action = SetMods(modifiers = Shift); };
    };
    xkb_symbols {
        key <ESC>  { [ Escape ] };
        key <AD01> { type = "TWO_LEVEL", [ q, Q ] };
        key <AC01> { type = "TWO_LEVEL", [ a, A ] };
        key <RTRN> { [ Return ] };
        key <LFSH> { [ Shift_L ] };
        key <UP>   { [ Up ] };
    };
};"#;
    Keymap::from_string(text).expect("test keymap compiles")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_letters_and_named_keys() {
        let keymap = test_keymap();
        // scancodes are evdev codes, xkb keycode minus 8
        assert_eq!(keymap.key(16), Some(Key::Char('q')));
        assert_eq!(keymap.key(30), Some(Key::Char('a')));
        assert_eq!(keymap.key(1), Some(Key::Escape));
        assert_eq!(keymap.key(28), Some(Key::Return));
        assert_eq!(keymap.key(103), Some(Key::Up));
    }

    #[test]
    fn modifier_update_changes_lookup_and_snapshot() {
        let mut keymap = test_keymap();
        assert!(!keymap.modifiers().shift);
        assert_eq!(keymap.key(16), Some(Key::Char('q')));

        // Depress the shift modifier (mod index 0 is Shift by convention in
        // the compiled map).
        keymap.update_modifiers(1, 0, 0, 0);
        assert!(keymap.modifiers().shift);
        assert_eq!(keymap.key(16), Some(Key::Char('Q')));

        keymap.update_modifiers(0, 0, 0, 0);
        assert!(!keymap.modifiers().shift);
        assert_eq!(keymap.key(16), Some(Key::Char('q')));
    }

    #[test]
    fn unmapped_scancode_translates_to_none() {
        let keymap = test_keymap();
        assert_eq!(keymap.key(200), None);
    }
}
