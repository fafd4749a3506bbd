//! Capture coordinator
//!
//! Bridges the two halves of the protocol: the session-bus side where the
//! QEMU VM and console objects live, and the private P2P channel QEMU
//! drives the listener over. Owns every long-lived resource so teardown
//! has a single call site.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{io, mem};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use zbus::zvariant::Fd;
use zbus::Connection;

use crate::channel::PeerChannel;
use crate::config::Config;
use crate::framebuffer::{FrameBuffer, FrameSnapshot};
use crate::listener::ListenerService;
use crate::proxies::{console_path, ConsoleProxy, KeyboardProxy, MouseProxy, VmProxy};

/// Socket-pair buffer size. Inline scanouts carry whole frames, so the
/// defaults (typically 208 KiB) stall QEMU's display thread.
const SOCKET_BUFFER_BYTES: libc::c_int = 16 * 1024 * 1024;

/// A connected capture session against one QEMU console
pub struct CaptureCoordinator {
    channel: PeerChannel,
    service: ListenerService,
    frame: Arc<Mutex<FrameBuffer>>,
    mouse: MouseProxy<'static>,
    keyboard: KeyboardProxy<'static>,
    torn_down: AtomicBool,
}

impl CaptureCoordinator {
    /// Discover the configured console on the session bus, register the
    /// listener socket and bring up the P2P channel.
    pub async fn connect(config: &Config) -> Result<Self> {
        let session = Connection::session()
            .await
            .context("Failed to connect to the session bus")?;

        let vm = VmProxy::new(&session)
            .await
            .context("Failed to reach the QEMU VM object")?;
        let vm_name = vm.name().await.unwrap_or_else(|_| "<unnamed>".to_string());
        let console_ids = vm
            .console_ids()
            .await
            .context("Failed to read the console list")?;
        info!("VM '{vm_name}' exposes consoles {console_ids:?}");

        let console_id = config.capture.console;
        if !console_ids.contains(&console_id) {
            bail!("console {console_id} not found, available: {console_ids:?}");
        }
        let path = console_path(console_id);

        let console = ConsoleProxy::builder(&session)
            .path(path.clone())
            .context("Invalid console object path")?
            .build()
            .await
            .context("Failed to reach the console object")?;

        let width = console.width().await.context("Failed to read console width")?;
        let height = console
            .height()
            .await
            .context("Failed to read console height")?;
        let label = console.label().await.unwrap_or_default();
        info!("Capturing console {console_id} ('{label}'), {width}x{height}");

        let frame = Arc::new(Mutex::new(FrameBuffer::new(width, height)));
        let service = ListenerService::new(frame.clone());

        // QEMU keeps its half of the pair; ours becomes the D-Bus transport.
        let (ours, theirs) = listener_socket_pair().context("Failed to create listener socket")?;
        console
            .register_listener(Fd::from(theirs.as_fd()))
            .await
            .context("RegisterListener failed")?;
        drop(theirs); // QEMU holds its own duplicate now

        let channel = PeerChannel::establish(ours, service.clone())
            .await
            .context("Failed to establish the peer channel")?;

        if let (Some(w), Some(h)) = (config.capture.preferred_width, config.capture.preferred_height)
        {
            // Best effort; the guest may ignore or clamp the hint
            if let Err(e) = console.set_ui_info(0, 0, 0, 0, w, h).await {
                warn!("SetUIInfo({w}x{h}) failed: {e}");
            } else {
                info!("Requested guest resolution {w}x{h}");
            }
        }

        let mouse = MouseProxy::builder(&session)
            .path(path.clone())
            .context("Invalid console object path")?
            .build()
            .await
            .context("Failed to reach the mouse object")?;
        let keyboard = KeyboardProxy::builder(&session)
            .path(path)
            .context("Invalid console object path")?
            .build()
            .await
            .context("Failed to reach the keyboard object")?;

        Ok(Self {
            channel,
            service,
            frame,
            mouse,
            keyboard,
            torn_down: AtomicBool::new(false),
        })
    }

    /// Take a snapshot of the frame if anything changed since the last
    /// call; `None` while the frame is unchanged. All mutations between
    /// two calls coalesce into one snapshot.
    pub fn get_frame_if_changed(&self) -> Option<FrameSnapshot> {
        let mut fb = self.frame.lock().unwrap();
        fb.take_dirty().then(|| fb.snapshot())
    }

    /// Current snapshot regardless of the dirty state; does not clear it
    pub fn current_frame(&self) -> FrameSnapshot {
        self.frame.lock().unwrap().snapshot()
    }

    pub async fn forward_mouse_move(&self, x: u32, y: u32) {
        if let Err(e) = self.mouse.set_abs_position(x, y).await {
            warn!("mouse move forwarding failed: {e}");
        }
    }

    pub async fn forward_mouse_press(&self, button: u32) {
        if let Err(e) = self.mouse.press(button).await {
            warn!("mouse press forwarding failed: {e}");
        }
    }

    pub async fn forward_mouse_release(&self, button: u32) {
        if let Err(e) = self.mouse.release(button).await {
            warn!("mouse release forwarding failed: {e}");
        }
    }

    pub async fn forward_key_press(&self, keycode: u32) {
        if let Err(e) = self.keyboard.press(keycode).await {
            warn!("key press forwarding failed: {e}");
        }
    }

    pub async fn forward_key_release(&self, keycode: u32) {
        if let Err(e) = self.keyboard.release(keycode).await {
            warn!("key release forwarding failed: {e}");
        }
    }

    /// Close the peer channel first, then release the shared buffer and
    /// GPU worker. Safe to call more than once.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Tearing down capture session");
        self.channel.close().await;
        self.service.release_resources();
    }
}

/// Build the listener socket pair with enlarged kernel buffers
fn listener_socket_pair() -> io::Result<(StdUnixStream, OwnedFd)> {
    let (ours, theirs) = StdUnixStream::pair()?;
    for stream in [&ours, &theirs] {
        grow_socket_buffer(stream.as_raw_fd(), libc::SO_SNDBUF);
        grow_socket_buffer(stream.as_raw_fd(), libc::SO_RCVBUF);
    }
    Ok((ours, OwnedFd::from(theirs)))
}

fn grow_socket_buffer(fd: i32, opt: libc::c_int) {
    // SAFETY: setsockopt on a fd we own with a properly sized option value.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &SOCKET_BUFFER_BYTES as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        // The kernel clamps to net.core.*mem_max anyway
        warn!(
            "setsockopt({}) failed: {}",
            if opt == libc::SO_SNDBUF {
                "SO_SNDBUF"
            } else {
                "SO_RCVBUF"
            },
            io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_pair_buffers_grow() {
        let (ours, theirs) = listener_socket_pair().unwrap();
        for fd in [ours.as_raw_fd(), theirs.as_raw_fd()] {
            let mut value: libc::c_int = 0;
            let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_SNDBUF,
                    &mut value as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            assert_eq!(rc, 0);
            // The kernel may clamp below the request but never below default
            assert!(value >= 208 * 1024, "send buffer too small: {value}");
        }
    }
}
