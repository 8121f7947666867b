//! Central dispatch state and the protocol listeners.
//!
//! All `Dispatch` impls live on [`WinState`]. Depending on the chosen
//! discipline the state is driven either by the poll thread (threaded) or by
//! the main thread (read-guard); either way only one thread touches it at a
//! time. Listener bodies translate, update bookkeeping and post portable
//! events; they log and drop malformed input instead of panicking.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use wayland_client::backend::ObjectId;
use wayland_client::protocol::wl_callback::{self, WlCallback};
use wayland_client::protocol::wl_compositor::WlCompositor;
use wayland_client::protocol::wl_keyboard::{self, WlKeyboard};
use wayland_client::protocol::wl_output::{self, WlOutput};
use wayland_client::protocol::wl_pointer::{self, WlPointer};
use wayland_client::protocol::wl_region::WlRegion;
use wayland_client::protocol::wl_registry::{self, WlRegistry};
use wayland_client::protocol::wl_seat::{self, WlSeat};
use wayland_client::protocol::wl_shell::WlShell;
use wayland_client::protocol::wl_shell_surface::{self, WlShellSurface};
use wayland_client::protocol::wl_surface::{self, WlSurface};
use wayland_client::{delegate_noop, Dispatch, Proxy, QueueHandle, WEnum};

use crate::connection::SyncToken;
use crate::event::Event;
use crate::event_loop::EventLoopHandle;
use crate::output::{Mode, Output};
use crate::registry::{BindRule, GlobalObserver, RegistryRouter};
use crate::seat::{Seat, SeatData};
use crate::window::{Compositor, Shell};

/// User data tying an output proxy to its registry name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutputData(pub(crate) u32);

/// The dispatch target for every protocol listener.
pub(crate) struct WinState {
    handle: EventLoopHandle,
    router: RegistryRouter<WinState>,
    compositor: Option<Compositor>,
    shell: Option<Shell>,
    seats: Vec<Seat>,
    outputs: Arc<Mutex<Vec<Output>>>,
    entered_outputs: Vec<ObjectId>,
    surface_scale: i32,
}

impl std::fmt::Debug for WinState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinState")
            .field("seats", &self.seats)
            .field("surface_scale", &self.surface_scale)
            .finish_non_exhaustive()
    }
}

impl WinState {
    pub(crate) fn new(
        handle: EventLoopHandle,
        outputs: Arc<Mutex<Vec<Output>>>,
        observer: Box<dyn GlobalObserver>,
    ) -> WinState {
        WinState {
            handle,
            router: RegistryRouter::new(bind_rules(), observer),
            compositor: None,
            shell: None,
            seats: Vec::new(),
            outputs,
            entered_outputs: Vec::new(),
            surface_scale: 1,
        }
    }

    pub(crate) fn missing_required(&self) -> Vec<&'static str> {
        self.router.missing_required()
    }

    pub(crate) fn take_compositor(&mut self) -> Option<Compositor> {
        self.compositor.take()
    }

    pub(crate) fn take_shell(&mut self) -> Option<Shell> {
        self.shell.take()
    }

    fn seat_mut(&mut self, registry_name: u32) -> Option<&mut Seat> {
        self.seats.iter_mut().find(|s| s.registry_name() == registry_name)
    }

    fn remove_seat(&mut self, registry_name: u32) {
        self.seats.retain(|s| s.registry_name() != registry_name);
    }

    fn remove_output(&mut self, registry_name: u32) {
        self.outputs
            .lock()
            .unwrap()
            .retain(|o| o.registry_name() != registry_name);
        self.handle.post_event(Event::OutputsChanged);
        self.recompute_scale();
    }

    fn with_output<R>(&self, registry_name: u32, f: impl FnOnce(&Output) -> R) -> Option<R> {
        let outputs = self.outputs.lock().unwrap();
        outputs
            .iter()
            .find(|o| o.registry_name() == registry_name)
            .map(f)
    }

    /// The preferred buffer scale is the maximum scale of the outputs the
    /// surface is currently visible on.
    fn recompute_scale(&mut self) {
        let scale = {
            let outputs = self.outputs.lock().unwrap();
            self.entered_outputs
                .iter()
                .filter_map(|id| outputs.iter().find(|o| o.wl_output().id() == *id))
                .map(|o| o.scale())
                .max()
                .unwrap_or(1)
        };
        if scale != self.surface_scale {
            debug!(scale, "preferred buffer scale changed");
            self.surface_scale = scale;
            self.handle.post_event(Event::ScaleChanged { scale });
        }
    }
}

/// The registration policy: which globals get bound, at which versions, and
/// what happens when one is withdrawn.
fn bind_rules() -> Vec<BindRule<WinState>> {
    vec![
        BindRule {
            interface: "wl_compositor",
            min_version: 1,
            max_version: 4,
            required: true,
            bind: |state, registry, qh, name, version| {
                let compositor = registry.bind::<WlCompositor, _, _>(name, version, qh, ());
                state.compositor = Some(Compositor::new(compositor));
            },
            removed: None,
        },
        BindRule {
            interface: "wl_shell",
            min_version: 1,
            max_version: 1,
            required: true,
            bind: |state, registry, qh, name, version| {
                let shell = registry.bind::<WlShell, _, _>(name, version, qh, ());
                state.shell = Some(Shell::new(shell));
            },
            removed: None,
        },
        BindRule {
            interface: "wl_seat",
            min_version: 1,
            max_version: 5,
            required: false,
            bind: |state, registry, qh, name, version| {
                let seat = registry.bind::<WlSeat, _, _>(name, version, qh, SeatData(name));
                state.seats.push(Seat::new(seat, name, state.handle.clone()));
            },
            removed: Some(|state, name| state.remove_seat(name)),
        },
        BindRule {
            interface: "wl_output",
            min_version: 2,
            max_version: 3,
            required: true,
            bind: |state, registry, qh, name, version| {
                let output = registry.bind::<WlOutput, _, _>(name, version, qh, OutputData(name));
                state.outputs.lock().unwrap().push(Output::new(output, name));
            },
            removed: Some(|state, name| state.remove_output(name)),
        },
    ]
}

impl Dispatch<WlRegistry, ()> for WinState {
    fn event(
        state: &mut Self,
        registry: &WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &wayland_client::Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global { name, interface, version } => {
                if let Some(binding) = state.router.observe_global(name, &interface, version) {
                    (binding.bind)(state, registry, qh, name, binding.version);
                }
            }
            wl_registry::Event::GlobalRemove { name } => {
                if let Some(entry) = state.router.global(name) {
                    debug!(name, interface = %entry.interface, "global withdrawn");
                }
                if let Some(removed) = state.router.observe_removal(name) {
                    removed(state, name);
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<WlCallback, SyncToken> for WinState {
    fn event(
        _: &mut Self,
        _: &WlCallback,
        event: wl_callback::Event,
        token: &SyncToken,
        _: &wayland_client::Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { .. } = event {
            token.fire();
        }
    }
}

impl Dispatch<WlSurface, ()> for WinState {
    fn event(
        state: &mut Self,
        _: &WlSurface,
        event: wl_surface::Event,
        _: &(),
        _: &wayland_client::Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            wl_surface::Event::Enter { output } => {
                state.entered_outputs.push(output.id());
                state.recompute_scale();
            }
            wl_surface::Event::Leave { output } => {
                state.entered_outputs.retain(|id| *id != output.id());
                state.recompute_scale();
            }
            _ => {}
        }
    }
}

impl Dispatch<WlShellSurface, ()> for WinState {
    fn event(
        state: &mut Self,
        shell_surface: &WlShellSurface,
        event: wl_shell_surface::Event,
        _: &(),
        _: &wayland_client::Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            wl_shell_surface::Event::Ping { serial } => {
                // Unanswered pings get the client marked unresponsive.
                shell_surface.pong(serial);
            }
            wl_shell_surface::Event::Configure { width, height, .. } => {
                state.handle.post_event(Event::Configure { width, height });
            }
            _ => {}
        }
    }
}

impl Dispatch<WlSeat, SeatData> for WinState {
    fn event(
        state: &mut Self,
        _: &WlSeat,
        event: wl_seat::Event,
        data: &SeatData,
        _: &wayland_client::Connection,
        qh: &QueueHandle<Self>,
    ) {
        let Some(seat) = state.seat_mut(data.0) else {
            return;
        };
        match event {
            wl_seat::Event::Capabilities { capabilities } => match capabilities {
                WEnum::Value(capabilities) => seat.update_capabilities(capabilities, qh),
                WEnum::Unknown(value) => {
                    warn!(value, "seat advertised unknown capability bits, ignored")
                }
            },
            wl_seat::Event::Name { name } => seat.set_name(name),
            _ => {}
        }
    }
}

impl Dispatch<WlPointer, SeatData> for WinState {
    fn event(
        state: &mut Self,
        _: &WlPointer,
        event: wl_pointer::Event,
        data: &SeatData,
        _: &wayland_client::Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(pointer) = state.seat_mut(data.0).and_then(|s| s.pointer_mut()) else {
            return;
        };
        match event {
            wl_pointer::Event::Enter {
                serial,
                surface_x,
                surface_y,
                ..
            } => pointer.on_enter(serial, surface_x, surface_y),
            wl_pointer::Event::Leave { .. } => pointer.on_leave(),
            wl_pointer::Event::Motion {
                time,
                surface_x,
                surface_y,
            } => pointer.on_motion(time, surface_x, surface_y),
            wl_pointer::Event::Button {
                time, button, state: button_state, ..
            } => match button_state {
                WEnum::Value(button_state) => pointer.on_button(
                    time,
                    button,
                    button_state == wl_pointer::ButtonState::Pressed,
                ),
                WEnum::Unknown(value) => warn!(value, "unknown button state, dropped"),
            },
            wl_pointer::Event::Axis { time, axis, value } => match axis {
                WEnum::Value(axis) => {
                    pointer.on_axis(time, axis == wl_pointer::Axis::VerticalScroll, value)
                }
                WEnum::Unknown(value) => warn!(value, "unknown scroll axis, dropped"),
            },
            _ => {}
        }
    }
}

impl Dispatch<WlKeyboard, SeatData> for WinState {
    fn event(
        state: &mut Self,
        _: &WlKeyboard,
        event: wl_keyboard::Event,
        data: &SeatData,
        _: &wayland_client::Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(keyboard) = state.seat_mut(data.0).and_then(|s| s.keyboard_mut()) else {
            return;
        };
        match event {
            wl_keyboard::Event::Keymap { format, fd, size } => keyboard.on_keymap(format, fd, size),
            wl_keyboard::Event::Enter { .. } => keyboard.logic().on_enter(),
            wl_keyboard::Event::Leave { .. } => keyboard.logic().on_leave(),
            wl_keyboard::Event::Key {
                time, key, state: key_state, ..
            } => match key_state {
                WEnum::Value(key_state) => keyboard.logic().on_key(
                    time,
                    key,
                    key_state == wl_keyboard::KeyState::Pressed,
                ),
                WEnum::Unknown(value) => warn!(value, "unknown key state, dropped"),
            },
            wl_keyboard::Event::Modifiers {
                mods_depressed,
                mods_latched,
                mods_locked,
                group,
                ..
            } => keyboard
                .logic()
                .on_modifiers(mods_depressed, mods_latched, mods_locked, group),
            wl_keyboard::Event::RepeatInfo { rate, delay } => {
                keyboard.logic().on_repeat_info(rate, delay)
            }
            _ => {}
        }
    }
}

impl Dispatch<WlOutput, OutputData> for WinState {
    fn event(
        state: &mut Self,
        _: &WlOutput,
        event: wl_output::Event,
        data: &OutputData,
        _: &wayland_client::Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            wl_output::Event::Geometry {
                x,
                y,
                physical_width,
                physical_height,
                make,
                model,
                ..
            } => {
                state.with_output(data.0, |output| {
                    output.state().lock().unwrap().apply_geometry(
                        x,
                        y,
                        physical_width,
                        physical_height,
                        make,
                        model,
                    );
                });
            }
            wl_output::Event::Mode {
                flags,
                width,
                height,
                refresh,
            } => {
                let (current, preferred) = match flags {
                    WEnum::Value(flags) => (
                        flags.contains(wl_output::Mode::Current),
                        flags.contains(wl_output::Mode::Preferred),
                    ),
                    WEnum::Unknown(value) => {
                        warn!(value, "unknown mode flags, treating as unflagged");
                        (false, false)
                    }
                };
                state.with_output(data.0, |output| {
                    output.state().lock().unwrap().apply_mode(
                        Mode {
                            width,
                            height,
                            refresh,
                        },
                        current,
                        preferred,
                    );
                });
            }
            wl_output::Event::Scale { factor } => {
                state.with_output(data.0, |output| {
                    output.state().lock().unwrap().apply_scale(factor);
                });
            }
            wl_output::Event::Done => {
                let newly_done = state
                    .with_output(data.0, |output| {
                        let first = !output.is_done();
                        output.state().lock().unwrap().apply_done();
                        first
                    })
                    .unwrap_or(false);
                if newly_done {
                    state.handle.post_event(Event::OutputsChanged);
                }
                state.recompute_scale();
            }
            _ => {}
        }
    }
}

delegate_noop!(WinState: WlCompositor);
delegate_noop!(WinState: WlShell);
delegate_noop!(WinState: WlRegion);
