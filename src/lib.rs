//! QEMU D-Bus display listener
//!
//! Connects to a QEMU instance started with `-display dbus`, registers as
//! a display listener over a private socket pair, and maintains an RGB
//! frame buffer mirroring the guest display. Consumers poll
//! [`capture::CaptureCoordinator::get_frame_if_changed`] for coalesced
//! frame snapshots and forward input through the same coordinator.

pub mod capture;
pub mod channel;
pub mod config;
pub mod framebuffer;
pub mod gpu;
pub mod listener;
pub mod pixel;
pub mod proxies;
pub mod shared_buffer;
