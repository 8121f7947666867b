//! Compositor output (monitor) state.
//!
//! Output properties trickle in as individual protocol events terminated by
//! `done`. The accumulated state lives behind an `Arc<Mutex<_>>` so the main
//! thread can query it while the dispatch thread keeps applying updates.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;
use wayland_client::protocol::wl_output::WlOutput;
use wayland_client::Proxy;

/// One display mode of an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mode {
    /// Width in physical pixels.
    pub width: i32,
    /// Height in physical pixels.
    pub height: i32,
    /// Vertical refresh rate in millihertz.
    pub refresh: i32,
}

impl Mode {
    /// Refresh rate in hertz.
    pub fn refresh_hz(&self) -> f32 {
        self.refresh as f32 / 1000.0
    }
}

/// Accumulated per-output state, independent of the wire.
#[derive(Debug, Default)]
pub(crate) struct OutputState {
    position: (i32, i32),
    physical_mm: (i32, i32),
    make: String,
    model: String,
    scale: i32,
    modes: Vec<Mode>,
    current: Option<usize>,
    preferred: Option<usize>,
    done: bool,
}

impl OutputState {
    pub(crate) fn new() -> OutputState {
        OutputState {
            // Compositors below wl_output v2 never send a scale event.
            scale: 1,
            ..OutputState::default()
        }
    }

    pub(crate) fn apply_geometry(
        &mut self,
        x: i32,
        y: i32,
        physical_width: i32,
        physical_height: i32,
        make: String,
        model: String,
    ) {
        self.position = (x, y);
        self.physical_mm = (physical_width, physical_height);
        self.make = make;
        self.model = model;
    }

    /// Records a mode advertisement.
    ///
    /// Identical dimensions and refresh update the existing entry instead of
    /// duplicating it. A current or preferred flag moves the respective
    /// marker here, so at most one mode carries each regardless of the order
    /// the compositor sends them in.
    pub(crate) fn apply_mode(&mut self, mode: Mode, current: bool, preferred: bool) {
        let index = match self.modes.iter().position(|m| *m == mode) {
            Some(index) => index,
            None => {
                self.modes.push(mode);
                self.modes.len() - 1
            }
        };
        if current {
            self.current = Some(index);
        }
        if preferred {
            self.preferred = Some(index);
        }
    }

    pub(crate) fn apply_scale(&mut self, scale: i32) {
        self.scale = scale;
    }

    pub(crate) fn apply_done(&mut self) {
        self.done = true;
    }

    fn current_mode(&self) -> Mode {
        self.modes[self
            .current
            .expect("output queried for its current mode before the compositor flagged one")]
    }

    fn preferred_mode(&self) -> Mode {
        self.modes[self
            .preferred
            .expect("output queried for its preferred mode before the compositor flagged one")]
    }

    fn dpi(&self) -> f32 {
        const FALLBACK_DPI: f32 = 96.0;
        let (mm_w, mm_h) = self.physical_mm;
        if mm_w <= 0 || mm_h <= 0 {
            return FALLBACK_DPI;
        }
        let mode = self.current_mode();
        let dpi_x = mode.width as f32 * 25.4 / mm_w as f32;
        let dpi_y = mode.height as f32 * 25.4 / mm_h as f32;
        (dpi_x + dpi_y) / 2.0
    }

    fn display_name(&self) -> String {
        let name = format!("{} {}", self.make, self.model);
        name.trim().to_owned()
    }
}

/// A bound `wl_output` global and its accumulated state.
///
/// Releases the protocol object on drop.
pub struct Output {
    output: WlOutput,
    registry_name: u32,
    state: Arc<Mutex<OutputState>>,
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("registry_name", &self.registry_name)
            .field("state", &self.state.lock().unwrap())
            .finish()
    }
}

impl Output {
    pub(crate) fn new(output: WlOutput, registry_name: u32) -> Output {
        Output {
            output,
            registry_name,
            state: Arc::new(Mutex::new(OutputState::new())),
        }
    }

    /// The registry name this output was advertised under.
    pub fn registry_name(&self) -> u32 {
        self.registry_name
    }

    pub(crate) fn wl_output(&self) -> &WlOutput {
        &self.output
    }

    pub(crate) fn state(&self) -> Arc<Mutex<OutputState>> {
        self.state.clone()
    }

    /// Position of the output in the compositor's global space.
    pub fn position(&self) -> (i32, i32) {
        self.state.lock().unwrap().position
    }

    /// Physical size in millimeters, as advertised.
    pub fn physical_size_mm(&self) -> (i32, i32) {
        self.state.lock().unwrap().physical_mm
    }

    /// All advertised modes, in advertisement order.
    pub fn modes(&self) -> Vec<Mode> {
        self.state.lock().unwrap().modes.clone()
    }

    /// The mode currently in use.
    ///
    /// # Panics
    ///
    /// Panics if the compositor has not flagged a current mode yet. Callers
    /// must round-trip after binding before querying modes.
    pub fn current_mode(&self) -> Mode {
        self.state.lock().unwrap().current_mode()
    }

    /// The mode the compositor prefers.
    ///
    /// # Panics
    ///
    /// Panics if no preferred mode was flagged yet, see
    /// [`Output::current_mode`].
    pub fn preferred_mode(&self) -> Mode {
        self.state.lock().unwrap().preferred_mode()
    }

    /// Integer buffer scale, 1 unless the compositor advertised otherwise.
    pub fn scale(&self) -> i32 {
        self.state.lock().unwrap().scale
    }

    /// Dots per inch derived from the current mode and the physical size.
    /// Falls back to 96 when the compositor reports no usable physical size.
    pub fn dpi(&self) -> f32 {
        self.state.lock().unwrap().dpi()
    }

    /// Human readable name built from make and model.
    pub fn display_name(&self) -> String {
        self.state.lock().unwrap().display_name()
    }

    /// Whether the initial burst of property events has been terminated by
    /// `done` at least once.
    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        debug!(registry_name = self.registry_name, "releasing output");
        // release exists from v3 on; earlier versions have no destructor.
        if self.output.version() >= 3 {
            self.output.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M1080: Mode = Mode {
        width: 1920,
        height: 1080,
        refresh: 60_000,
    };
    const M1440: Mode = Mode {
        width: 2560,
        height: 1440,
        refresh: 59_951,
    };

    #[test]
    fn flags_are_singular_regardless_of_arrival_order() {
        // Flagged mode first, then another mode takes the flag over.
        let mut state = OutputState::new();
        state.apply_mode(M1080, true, true);
        state.apply_mode(M1440, true, false);
        assert_eq!(state.current_mode(), M1440);
        assert_eq!(state.preferred_mode(), M1080);

        // Same advertisements, opposite order.
        let mut state = OutputState::new();
        state.apply_mode(M1440, true, false);
        state.apply_mode(M1080, false, true);
        state.apply_mode(M1080, true, false);
        assert_eq!(state.current_mode(), M1080);
        assert_eq!(state.preferred_mode(), M1080);
        assert_eq!(state.modes.len(), 2);
    }

    #[test]
    fn duplicate_mode_advertisements_are_merged() {
        let mut state = OutputState::new();
        state.apply_mode(M1080, false, false);
        state.apply_mode(M1080, true, true);
        assert_eq!(state.modes.len(), 1);
        assert_eq!(state.current_mode(), M1080);
    }

    #[test]
    #[should_panic(expected = "before the compositor flagged one")]
    fn current_mode_before_any_flag_panics() {
        let mut state = OutputState::new();
        state.apply_mode(M1080, false, false);
        state.current_mode();
    }

    #[test]
    fn dpi_derives_from_current_mode_and_physical_size() {
        let mut state = OutputState::new();
        state.apply_geometry(0, 0, 509, 286, "ACME".into(), "HD Display".into());
        state.apply_mode(M1080, true, true);
        let dpi = state.dpi();
        assert!((dpi - 95.8).abs() < 0.5, "dpi was {dpi}");
    }

    #[test]
    fn dpi_falls_back_without_physical_size() {
        let mut state = OutputState::new();
        state.apply_mode(M1080, true, false);
        assert_eq!(state.dpi(), 96.0);
    }

    #[test]
    fn display_name_joins_make_and_model() {
        let mut state = OutputState::new();
        state.apply_geometry(0, 0, 509, 286, "ACME".into(), "HD Display".into());
        assert_eq!(state.display_name(), "ACME HD Display");

        let mut state = OutputState::new();
        state.apply_geometry(0, 0, 0, 0, String::new(), "Internal".into());
        assert_eq!(state.display_name(), "Internal");
    }

    #[test]
    fn scale_defaults_to_one() {
        let state = OutputState::new();
        assert_eq!(state.scale, 1);
    }
}
