//! Broker-less peer channel
//!
//! QEMU hands us one end of a socket pair after `RegisterListener`; this
//! module turns that raw stream into a P2P D-Bus connection with the
//! listener interfaces exported at `/org/qemu/Display1/Listener`. The
//! interfaces are registered before the handshake completes, so calls QEMU
//! issues immediately after registration are queued, never lost.

use std::io;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Mutex;

use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, warn};
use zbus::Connection;

use crate::listener::ListenerService;

pub const LISTENER_PATH: &str = "/org/qemu/Display1/Listener";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to prepare listener socket: {0}")]
    Socket(#[from] io::Error),

    #[error("peer connection failed: {0}")]
    Bus(#[from] zbus::Error),
}

/// Core listener interface, sync handlers dispatching into [`ListenerService`]
struct DisplayListener {
    service: ListenerService,
}

#[zbus::interface(name = "org.qemu.Display1.Listener")]
impl DisplayListener {
    fn scanout(&self, width: u32, height: u32, stride: u32, pixman_format: u32, data: Vec<u8>) {
        self.service.scanout(width, height, stride, pixman_format, &data);
    }

    #[allow(clippy::too_many_arguments)]
    fn update(
        &self,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        stride: u32,
        pixman_format: u32,
        data: Vec<u8>,
    ) {
        self.service
            .update(x, y, width, height, stride, pixman_format, &data);
    }

    // Default CamelCase mapping would give "ScanoutDmabuf"
    #[zbus(name = "ScanoutDMABUF")]
    #[allow(clippy::too_many_arguments)]
    fn scanout_dmabuf(
        &self,
        fd: zbus::zvariant::OwnedFd,
        width: u32,
        height: u32,
        stride: u32,
        fourcc: u32,
        modifier: u64,
        y0_top: bool,
    ) {
        self.service
            .scanout_dmabuf(fd.into(), width, height, stride, fourcc, modifier, y0_top);
    }

    #[zbus(name = "UpdateDMABUF")]
    fn update_dmabuf(&self, x: i32, y: i32, width: i32, height: i32) {
        self.service.update_dmabuf(x, y, width, height);
    }

    fn disable(&self) {
        self.service.disable();
    }

    fn mouse_set(&self, x: i32, y: i32, on: i32) {
        self.service.mouse_set(x, y, on);
    }

    fn cursor_define(&self, width: i32, height: i32, hot_x: i32, hot_y: i32, data: Vec<u8>) {
        self.service.cursor_define(width, height, hot_x, hot_y, &data);
    }

    /// Advertises the optional capabilities QEMU probes before using them
    #[zbus(property)]
    fn interfaces(&self) -> Vec<String> {
        vec!["org.qemu.Display1.Listener.Unix.Map".to_string()]
    }
}

/// Shared-memory extension interface, exported at the same object path
struct MapListener {
    service: ListenerService,
}

#[zbus::interface(name = "org.qemu.Display1.Listener.Unix.Map")]
impl MapListener {
    fn scanout_map(
        &self,
        fd: zbus::zvariant::OwnedFd,
        offset: u32,
        width: u32,
        height: u32,
        stride: u32,
        pixman_format: u32,
    ) {
        self.service
            .scanout_map(fd.into(), offset, width, height, stride, pixman_format);
    }

    fn update_map(&self, x: i32, y: i32, width: i32, height: i32) {
        self.service.update_map(x, y, width, height);
    }
}

/// The established P2P connection, closed at most once
pub struct PeerChannel {
    conn: Mutex<Option<Connection>>,
}

impl PeerChannel {
    /// Run the D-Bus handshake over `stream` (our half of the socket pair)
    /// and export the listener interfaces. Fd passing is negotiated as part
    /// of the unix handshake; a peer without it fails the build here.
    pub async fn establish(
        stream: StdUnixStream,
        service: ListenerService,
    ) -> Result<Self, TransportError> {
        stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(stream)?;

        let conn = zbus::connection::Builder::unix_stream(stream)
            .p2p()
            .serve_at(
                LISTENER_PATH,
                DisplayListener {
                    service: service.clone(),
                },
            )?
            .serve_at(LISTENER_PATH, MapListener { service })?
            .build()
            .await?;

        debug!("peer channel established, listener exported at {LISTENER_PATH}");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Close the connection; later calls are no-ops
    pub async fn close(&self) {
        let conn = self.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            if let Err(e) = conn.close().await {
                warn!("peer channel close failed: {e}");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().unwrap().is_some()
    }
}
