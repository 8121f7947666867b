//! Surface and shell-surface wrappers for the application window.
//!
//! Each wrapper owns exactly one protocol object and issues its destructor on
//! drop. `wl_shell_surface` has no destructor in the protocol, its wrapper
//! only drops the proxy.

use std::fmt;

use bitflags::bitflags;
use tracing::debug;
use wayland_client::protocol::wl_compositor::WlCompositor;
use wayland_client::protocol::wl_region::WlRegion;
use wayland_client::protocol::wl_shell::WlShell;
use wayland_client::protocol::wl_shell_surface::WlShellSurface;
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_client::protocol::{wl_output, wl_shell_surface};
use wayland_client::{Dispatch, Proxy, QueueHandle};

bitflags! {
    /// Shell-surface role and state bits the window has requested.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WindowFlags: u32 {
        /// The surface is mapped as a plain toplevel.
        const TOPLEVEL = 1 << 0;
        /// The surface is mapped fullscreen.
        const FULLSCREEN = 1 << 1;
    }
}

/// An owned `wl_surface`.
pub struct Surface {
    surface: WlSurface,
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface").field("id", &self.surface.id()).finish()
    }
}

impl Surface {
    pub(crate) fn new(surface: WlSurface) -> Surface {
        Surface { surface }
    }

    pub(crate) fn wl_surface(&self) -> &WlSurface {
        &self.surface
    }

    /// Marks `region` as fully opaque, letting the compositor skip blending.
    /// `None` makes the whole surface transparent-capable again.
    pub fn set_opaque_region(&self, region: Option<&Region>) {
        self.surface.set_opaque_region(region.map(|r| &r.region));
    }

    /// Tells the compositor which scale the attached buffers are rendered
    /// at. Requires `wl_compositor` version 3.
    pub fn set_buffer_scale(&self, scale: i32) {
        if self.surface.version() >= 3 {
            self.surface.set_buffer_scale(scale);
        }
    }

    /// Commits pending surface state.
    pub fn commit(&self) {
        self.surface.commit();
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        self.surface.destroy();
    }
}

/// An owned `wl_region`.
pub struct Region {
    region: WlRegion,
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region").field("id", &self.region.id()).finish()
    }
}

impl Region {
    /// Adds a rectangle to the region.
    pub fn add(&self, x: i32, y: i32, width: i32, height: i32) {
        self.region.add(x, y, width, height);
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.region.destroy();
    }
}

/// The bound `wl_compositor` global, the factory for surfaces and regions.
pub(crate) struct Compositor {
    compositor: WlCompositor,
}

impl fmt::Debug for Compositor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compositor").field("id", &self.compositor.id()).finish()
    }
}

impl Compositor {
    pub(crate) fn new(compositor: WlCompositor) -> Compositor {
        Compositor { compositor }
    }

    pub(crate) fn create_surface<S>(&self, qh: &QueueHandle<S>) -> Surface
    where
        S: Dispatch<WlSurface, ()> + 'static,
    {
        Surface::new(self.compositor.create_surface(qh, ()))
    }

    pub(crate) fn create_region<S>(&self, qh: &QueueHandle<S>) -> Region
    where
        S: Dispatch<WlRegion, ()> + 'static,
    {
        Region {
            region: self.compositor.create_region(qh, ()),
        }
    }
}

/// The bound `wl_shell` global.
pub(crate) struct Shell {
    shell: WlShell,
}

impl fmt::Debug for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shell").field("id", &self.shell.id()).finish()
    }
}

impl Shell {
    pub(crate) fn new(shell: WlShell) -> Shell {
        Shell { shell }
    }

    pub(crate) fn get_shell_surface<S>(&self, surface: &Surface, qh: &QueueHandle<S>) -> ShellSurface
    where
        S: Dispatch<WlShellSurface, ()> + 'static,
    {
        ShellSurface {
            shell_surface: self.shell.get_shell_surface(surface.wl_surface(), qh, ()),
            flags: WindowFlags::empty(),
        }
    }
}

/// An owned `wl_shell_surface` with the role bits requested so far.
pub struct ShellSurface {
    shell_surface: WlShellSurface,
    flags: WindowFlags,
}

impl fmt::Debug for ShellSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellSurface")
            .field("id", &self.shell_surface.id())
            .field("flags", &self.flags)
            .finish()
    }
}

impl ShellSurface {
    /// Maps the surface as a plain toplevel window.
    pub fn set_toplevel(&mut self) {
        self.shell_surface.set_toplevel();
        self.flags = WindowFlags::TOPLEVEL;
    }

    /// Maps the surface fullscreen on `output`, or lets the compositor pick
    /// one.
    pub fn set_fullscreen(&mut self, output: Option<&wl_output::WlOutput>) {
        self.shell_surface.set_fullscreen(
            wl_shell_surface::FullscreenMethod::Driver,
            0,
            output,
        );
        self.flags = WindowFlags::FULLSCREEN;
    }

    /// Sets the window title shown by the compositor.
    pub fn set_title(&self, title: &str) {
        self.shell_surface.set_title(title.to_owned());
    }

    /// Role bits requested so far.
    pub fn flags(&self) -> WindowFlags {
        self.flags
    }
}

/// The application window: surface, shell role and the opaque region that
/// tracks its size.
#[derive(Debug)]
pub struct Window {
    surface: Surface,
    shell_surface: ShellSurface,
    compositor: Compositor,
    size: (i32, i32),
}

impl Window {
    pub(crate) fn new(surface: Surface, shell_surface: ShellSurface, compositor: Compositor) -> Window {
        Window {
            surface,
            shell_surface,
            compositor,
            size: (0, 0),
        }
    }

    /// The underlying surface.
    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    /// The shell role of the surface.
    pub fn shell_surface(&mut self) -> &mut ShellSurface {
        &mut self.shell_surface
    }

    /// Current surface size in surface coordinates, as last set through
    /// [`Window::set_size`].
    pub fn size(&self) -> (i32, i32) {
        self.size
    }

    /// Resizes the window's bookkeeping and re-declares the opaque region to
    /// match. The application renders opaque frames, so the full surface is
    /// marked opaque.
    pub fn set_size<S>(&mut self, qh: &QueueHandle<S>, width: i32, height: i32)
    where
        S: Dispatch<WlRegion, ()> + 'static,
    {
        debug!(width, height, "window resized");
        self.size = (width, height);
        let region = self.compositor.create_region(qh);
        region.add(0, 0, width, height);
        self.surface.set_opaque_region(Some(&region));
        self.surface.commit();
    }
}
