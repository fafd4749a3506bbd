//! Proxies for the QEMU-side display objects
//!
//! These cover the session-bus half of the protocol: discovering consoles
//! on the VM object, registering the listener socket, and forwarding input
//! through the per-console Mouse and Keyboard interfaces.

use zbus::proxy;
use zbus::zvariant::Fd;

/// Well-known name QEMU claims on the session bus (`-display dbus`)
pub const QEMU_SERVICE: &str = "org.qemu";

/// Object path of console `id`
pub fn console_path(id: u32) -> String {
    format!("/org/qemu/Display1/Console_{id}")
}

#[proxy(
    interface = "org.qemu.Display1.VM",
    default_service = "org.qemu",
    default_path = "/org/qemu/Display1/VM"
)]
pub trait Vm {
    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;

    #[zbus(property, name = "ConsoleIDs")]
    fn console_ids(&self) -> zbus::Result<Vec<u32>>;
}

#[proxy(interface = "org.qemu.Display1.Console", default_service = "org.qemu")]
pub trait Console {
    /// Hand QEMU its half of the listener socket pair. QEMU starts calling
    /// the listener as soon as this returns.
    fn register_listener(&self, listener: Fd<'_>) -> zbus::Result<()>;

    #[zbus(name = "SetUIInfo")]
    #[allow(clippy::too_many_arguments)]
    fn set_ui_info(
        &self,
        width_mm: u16,
        height_mm: u16,
        xoff: i32,
        yoff: i32,
        width: u32,
        height: u32,
    ) -> zbus::Result<()>;

    #[zbus(property)]
    fn label(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn width(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn height(&self) -> zbus::Result<u32>;
}

#[proxy(interface = "org.qemu.Display1.Mouse", default_service = "org.qemu")]
pub trait Mouse {
    fn set_abs_position(&self, x: u32, y: u32) -> zbus::Result<()>;

    fn press(&self, button: u32) -> zbus::Result<()>;

    fn release(&self, button: u32) -> zbus::Result<()>;
}

#[proxy(interface = "org.qemu.Display1.Keyboard", default_service = "org.qemu")]
pub trait Keyboard {
    /// `keycode` is a qemu qcode (XT scancode set)
    fn press(&self, keycode: u32) -> zbus::Result<()>;

    fn release(&self, keycode: u32) -> zbus::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_path_formatting() {
        assert_eq!(console_path(0), "/org/qemu/Display1/Console_0");
        assert_eq!(console_path(3), "/org/qemu/Display1/Console_3");
    }
}
