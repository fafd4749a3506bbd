//! Listener method contract
//!
//! Implements the fixed set of display methods QEMU invokes on the P2P
//! channel, translating each into a frame-buffer mutation or shared-buffer
//! lifecycle action. QEMU's calls are notifications: a locally dropped
//! frame (unsupported format, failed import, bad region) is logged and the
//! call is still acknowledged, never surfaced as a protocol error.

use std::collections::HashSet;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, trace, warn};

use crate::framebuffer::{FrameBuffer, Region};
use crate::gpu::{GpuWorker, ImportRequest};
use crate::pixel::{self, PixelFormat};
use crate::shared_buffer::{BufferKind, SharedBuffer};

/// Dispatch target for every incoming listener call.
///
/// Cheap to clone; clones share the frame buffer, the single shared-buffer
/// slot and the GPU worker.
#[derive(Clone)]
pub struct ListenerService {
    inner: Arc<Inner>,
}

struct Inner {
    frame: Arc<Mutex<FrameBuffer>>,
    /// At most one live imported buffer; replacing drops (and thereby
    /// unmaps/closes) the predecessor first
    buffer: Mutex<Option<SharedBuffer>>,
    /// Lazily spawned, pinned GPU thread for DMA-BUF readback
    gpu: Mutex<Option<GpuWorker>>,
    /// Causes already reported, to keep high-frequency updates from flooding the log
    logged: Mutex<HashSet<String>>,
}

impl ListenerService {
    pub fn new(frame: Arc<Mutex<FrameBuffer>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                frame,
                buffer: Mutex::new(None),
                gpu: Mutex::new(None),
                logged: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Full refresh with inline pixels
    pub fn scanout(&self, width: u32, height: u32, stride: u32, format: u32, data: &[u8]) {
        debug!("Scanout: {width}x{height}, stride={stride}, format=0x{format:08x}");
        match pixel::decode_pixman(data, width, height, stride, format) {
            Ok(rgb) => self.apply_full(width, height, rgb),
            Err(e) => self.warn_once(&format!("Scanout dropped: {e}")),
        }
    }

    /// Partial refresh with inline pixels
    pub fn update(
        &self,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        stride: u32,
        format: u32,
        data: &[u8],
    ) {
        if x < 0 || y < 0 || width < 0 || height < 0 {
            self.warn_once(&format!(
                "Update dropped: negative region ({x},{y}) {width}x{height}"
            ));
            return;
        }
        let region = Region {
            x: x as u32,
            y: y as u32,
            width: width as u32,
            height: height as u32,
        };
        let rgb = match pixel::decode_pixman(data, region.width, region.height, stride, format) {
            Ok(rgb) => rgb,
            Err(e) => {
                self.warn_once(&format!("Update dropped: {e}"));
                return;
            }
        };
        let mut frame = self.inner.frame.lock().unwrap();
        if let Err(e) = frame.write_region(region, &rgb) {
            drop(frame);
            self.warn_once(&format!("Update dropped: {e}"));
        }
    }

    /// Full refresh via a DMA-BUF descriptor. Replaces the current shared
    /// buffer, then performs the first read-back.
    pub fn scanout_dmabuf(
        &self,
        fd: OwnedFd,
        width: u32,
        height: u32,
        stride: u32,
        fourcc: u32,
        modifier: u64,
        y0_top: bool,
    ) {
        info!(
            "ScanoutDMABUF: {width}x{height}, stride={stride}, fourcc=0x{fourcc:08x}, \
             modifier=0x{modifier:x}, y0_top={y0_top}"
        );

        let mut slot = self.inner.buffer.lock().unwrap();
        slot.take(); // release the predecessor before accepting the replacement

        if PixelFormat::from_fourcc(fourcc).is_none() {
            drop(slot);
            // fd just went out of scope: rejected buffers are closed, not leaked
            self.warn_once(&format!(
                "ScanoutDMABUF dropped: unsupported fourcc 0x{fourcc:08x}"
            ));
            return;
        }

        *slot = Some(SharedBuffer::dmabuf(
            fd, width, height, stride, fourcc, modifier, y0_top,
        ));
        drop(slot);
        self.read_back_current();
    }

    /// Region notification for the current DMA-BUF. The region is advisory;
    /// the whole buffer is re-read (QEMU keeps the buffer itself current).
    pub fn update_dmabuf(&self, x: i32, y: i32, width: i32, height: i32) {
        trace!("UpdateDMABUF: ({x},{y}) {width}x{height}");
        self.read_back_current();
    }

    /// Full refresh via a plain shared-memory descriptor
    pub fn scanout_map(
        &self,
        fd: OwnedFd,
        offset: u32,
        width: u32,
        height: u32,
        stride: u32,
        format: u32,
    ) {
        info!("ScanoutMap: {width}x{height}, stride={stride}, offset={offset}, format=0x{format:08x}");

        let mut slot = self.inner.buffer.lock().unwrap();
        slot.take();

        if PixelFormat::from_pixman(format).is_none() {
            drop(slot);
            self.warn_once(&format!(
                "ScanoutMap dropped: unsupported format 0x{format:08x}"
            ));
            return;
        }

        match SharedBuffer::map(fd, offset, width, height, stride, format) {
            Ok(buf) => {
                *slot = Some(buf);
                drop(slot);
                self.read_back_current();
            }
            Err(e) => {
                drop(slot);
                self.warn_once(&format!("ScanoutMap dropped: mmap failed: {e}"));
            }
        }
    }

    /// Region notification for the current mapped buffer; full re-read as above
    pub fn update_map(&self, x: i32, y: i32, width: i32, height: i32) {
        trace!("UpdateMap: ({x},{y}) {width}x{height}");
        self.read_back_current();
    }

    /// Release the current shared buffer. The last frame stays visible.
    pub fn disable(&self) {
        info!("Display disabled");
        self.inner.buffer.lock().unwrap().take();
    }

    /// Cursor position; acknowledged, cursor rendering is out of scope
    pub fn mouse_set(&self, x: i32, y: i32, on: i32) {
        trace!("MouseSet: ({x},{y}) on={on}");
    }

    /// Cursor shape; acknowledged, cursor rendering is out of scope
    pub fn cursor_define(&self, width: i32, height: i32, hot_x: i32, hot_y: i32, _data: &[u8]) {
        trace!("CursorDefine: {width}x{height} hotspot=({hot_x},{hot_y})");
    }

    /// Drop the shared buffer and the GPU worker. Called by teardown after
    /// the transport is closed, so no dispatch can still be reading them.
    pub fn release_resources(&self) {
        self.inner.buffer.lock().unwrap().take();
        self.inner.gpu.lock().unwrap().take();
    }

    /// Re-decode the whole current shared buffer into the frame buffer
    fn read_back_current(&self) {
        let slot = self.inner.buffer.lock().unwrap();
        let Some(buf) = slot.as_ref() else {
            return;
        };
        let (width, height) = (buf.width(), buf.height());

        let rgb = match buf.kind() {
            BufferKind::Mapped {
                map,
                offset,
                format_tag,
            } => pixel::decode_pixman(
                &map.as_slice()[*offset..],
                width,
                height,
                buf.stride(),
                *format_tag,
            )
            .map_err(|e| e.to_string()),
            BufferKind::DmaBuf {
                fourcc,
                modifier,
                y0_top,
            } => {
                let mut gpu = self.inner.gpu.lock().unwrap();
                let worker = gpu.get_or_insert_with(GpuWorker::spawn);
                worker
                    .import(ImportRequest {
                        fd: buf.raw_fd(),
                        width,
                        height,
                        stride: buf.stride(),
                        fourcc: *fourcc,
                        modifier: *modifier,
                    })
                    .map(|mut rgb| {
                        if !*y0_top {
                            pixel::flip_vertical(&mut rgb, width, height);
                        }
                        rgb
                    })
                    .map_err(|e| e.to_string())
            }
        };
        drop(slot);

        match rgb {
            Ok(rgb) => self.apply_full(width, height, rgb),
            Err(cause) => self.warn_once(&format!("shared buffer read-back dropped: {cause}")),
        }
    }

    fn apply_full(&self, width: u32, height: u32, rgb: Vec<u8>) {
        let mut frame = self.inner.frame.lock().unwrap();
        frame.resize(width, height);
        if let Err(e) = frame.write_full(&rgb) {
            drop(frame);
            self.warn_once(&format!("full update dropped: {e}"));
        }
    }

    fn warn_once(&self, cause: &str) {
        let mut logged = self.inner.logged.lock().unwrap();
        if logged.insert(cause.to_string()) {
            warn!("{cause} (further occurrences suppressed)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::{PIXMAN_R8G8B8, PIXMAN_X8R8G8B8};
    use crate::shared_buffer::tests::{fd_is_open, memfd_with};
    use std::os::fd::{AsRawFd, FromRawFd};

    fn service() -> (ListenerService, Arc<Mutex<FrameBuffer>>) {
        let frame = Arc::new(Mutex::new(FrameBuffer::new(640, 480)));
        (ListenerService::new(frame.clone()), frame)
    }

    fn plane(frame: &Arc<Mutex<FrameBuffer>>) -> Vec<u8> {
        frame.lock().unwrap().snapshot().data
    }

    #[test]
    fn test_scanout_resizes_and_decodes() {
        let (svc, frame) = service();
        svc.scanout(
            2,
            1,
            8,
            PIXMAN_X8R8G8B8,
            &[0x11, 0x22, 0x33, 0x00, 0x44, 0x55, 0x66, 0x00],
        );

        let fb = frame.lock().unwrap();
        assert_eq!((fb.width(), fb.height()), (2, 1));
        assert_eq!(fb.snapshot().data, vec![0x33, 0x22, 0x11, 0x66, 0x55, 0x44]);
    }

    #[test]
    fn test_update_touches_single_pixel() {
        let (svc, frame) = service();
        svc.scanout(2, 1, 8, PIXMAN_X8R8G8B8, &[0u8; 8]);
        svc.update(1, 0, 1, 1, 4, PIXMAN_R8G8B8, &[0xaa, 0xbb, 0xcc]);

        assert_eq!(plane(&frame), vec![0, 0, 0, 0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn test_out_of_bounds_update_leaves_frame_unchanged() {
        let (svc, frame) = service();
        svc.scanout(2, 1, 8, PIXMAN_X8R8G8B8, &[0x10u8; 8]);
        let before = plane(&frame);

        svc.update(1, 0, 2, 1, 8, PIXMAN_X8R8G8B8, &[0xffu8; 8]);
        assert_eq!(plane(&frame), before);
    }

    #[test]
    fn test_negative_update_origin_rejected() {
        let (svc, frame) = service();
        svc.scanout(2, 1, 8, PIXMAN_X8R8G8B8, &[0x10u8; 8]);
        let before = plane(&frame);

        svc.update(-1, 0, 1, 1, 4, PIXMAN_X8R8G8B8, &[0xffu8; 4]);
        assert_eq!(plane(&frame), before);
    }

    #[test]
    fn test_scanout_unsupported_format_keeps_previous_frame() {
        let (svc, frame) = service();
        svc.scanout(2, 1, 8, PIXMAN_X8R8G8B8, &[0x10u8; 8]);
        let before = plane(&frame);

        svc.scanout(2, 1, 8, 0xdead_beef, &[0xffu8; 8]);
        assert_eq!(plane(&frame), before);
    }

    #[test]
    fn test_scanout_map_decodes_shared_memory() {
        let (svc, frame) = service();
        let fd = memfd_with(&[0x11, 0x22, 0x33, 0x00, 0x44, 0x55, 0x66, 0x00]);
        svc.scanout_map(fd, 0, 2, 1, 8, PIXMAN_X8R8G8B8);

        assert_eq!(plane(&frame), vec![0x33, 0x22, 0x11, 0x66, 0x55, 0x44]);
    }

    #[test]
    fn test_update_map_rereads_current_contents() {
        let (svc, frame) = service();
        let fd = memfd_with(&[0u8; 8]);
        // Writer-side dup so the test can refresh the buffer after the
        // listener has taken ownership of the original descriptor.
        let writer = unsafe { OwnedFd::from_raw_fd(libc::dup(fd.as_raw_fd())) };
        svc.scanout_map(fd, 0, 2, 1, 8, PIXMAN_X8R8G8B8);
        assert_eq!(plane(&frame), vec![0u8; 6]);

        let new_bytes: [u8; 8] = [0x01, 0x02, 0x03, 0x00, 0x04, 0x05, 0x06, 0x00];
        let written = unsafe {
            libc::pwrite(
                writer.as_raw_fd(),
                new_bytes.as_ptr() as *const libc::c_void,
                new_bytes.len(),
                0,
            )
        };
        assert_eq!(written, new_bytes.len() as isize);

        svc.update_map(0, 0, 2, 1);
        assert_eq!(plane(&frame), vec![0x03, 0x02, 0x01, 0x06, 0x05, 0x04]);
    }

    #[test]
    fn test_replacement_closes_previous_descriptor() {
        let (svc, _frame) = service();

        let first = memfd_with(&[0u8; 8]);
        let first_raw = first.as_raw_fd();
        svc.scanout_map(first, 0, 2, 1, 8, PIXMAN_X8R8G8B8);
        assert!(fd_is_open(first_raw));

        let second = memfd_with(&[0u8; 8]);
        let second_raw = second.as_raw_fd();
        svc.scanout_map(second, 0, 2, 1, 8, PIXMAN_X8R8G8B8);
        assert!(!fd_is_open(first_raw), "replaced descriptor must be closed");
        assert!(fd_is_open(second_raw));

        svc.disable();
        assert!(!fd_is_open(second_raw), "disable must release the buffer");
    }

    #[test]
    fn test_unsupported_fourcc_closes_fd_and_keeps_frame() {
        let (svc, frame) = service();
        svc.scanout(2, 1, 8, PIXMAN_X8R8G8B8, &[0x10u8; 8]);
        let before = plane(&frame);

        let fd = memfd_with(&[0u8; 8]);
        let raw = fd.as_raw_fd();
        svc.scanout_dmabuf(fd, 2, 1, 8, 0x0000_1234, 0, true);

        assert_eq!(plane(&frame), before);
        assert!(!fd_is_open(raw), "rejected buffer descriptor must be closed");
    }
}
