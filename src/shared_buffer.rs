//! Imported shared buffers
//!
//! A [`SharedBuffer`] is the one externally-delivered buffer the listener
//! holds at any time. It owns the file descriptor QEMU passed with the
//! scanout call; dropping the buffer unmaps the memory and closes the
//! descriptor exactly once. The listener keeps at most one in an
//! `Option` slot, so replacement releases the predecessor first.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr;

use tracing::warn;

/// Read-only shared memory mapping, unmapped on drop
pub struct MapGuard {
    ptr: *mut libc::c_void,
    len: usize,
}

// The mapping is immutable after creation and only ever read.
unsafe impl Send for MapGuard {}

impl MapGuard {
    /// Map `len` bytes of `fd` read-only (MAP_SHARED, so later guest writes
    /// are visible to re-reads)
    pub fn map(fd: &OwnedFd, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty mapping"));
        }
        // SAFETY: mapping a caller-supplied fd read-only; failure is checked below.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is valid for `len` bytes until drop.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MapGuard {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        let rc = unsafe { libc::munmap(self.ptr, self.len) };
        if rc != 0 {
            warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

/// How the buffer contents are read back
pub enum BufferKind {
    /// Plain shared memory, decoded on the CPU
    Mapped {
        map: MapGuard,
        offset: usize,
        format_tag: u32,
    },
    /// GPU-resident buffer, re-imported and read back through EGL on every read
    DmaBuf {
        fourcc: u32,
        modifier: u64,
        y0_top: bool,
    },
}

/// The single live imported buffer
pub struct SharedBuffer {
    fd: OwnedFd,
    width: u32,
    height: u32,
    stride: u32,
    kind: BufferKind,
}

impl SharedBuffer {
    /// Import a plain shared-memory descriptor by mapping `stride * height + offset` bytes.
    pub fn map(
        fd: OwnedFd,
        offset: u32,
        width: u32,
        height: u32,
        stride: u32,
        format_tag: u32,
    ) -> io::Result<Self> {
        let len = stride as usize * height as usize + offset as usize;
        let map = MapGuard::map(&fd, len)?;
        Ok(Self {
            fd,
            width,
            height,
            stride,
            kind: BufferKind::Mapped {
                map,
                offset: offset as usize,
                format_tag,
            },
        })
    }

    /// Take ownership of a DMA-BUF descriptor. No import happens here; the
    /// GPU image is created (and destroyed) on every read-back.
    pub fn dmabuf(
        fd: OwnedFd,
        width: u32,
        height: u32,
        stride: u32,
        fourcc: u32,
        modifier: u64,
        y0_top: bool,
    ) -> Self {
        Self {
            fd,
            width,
            height,
            stride,
            kind: BufferKind::DmaBuf {
                fourcc,
                modifier,
                y0_top,
            },
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn kind(&self) -> &BufferKind {
        &self.kind
    }

    /// Raw descriptor for the GPU import call. The fd stays owned by this
    /// buffer; callers must finish with it before the buffer is dropped.
    pub fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::fd::FromRawFd;

    /// memfd populated with `data`, for exercising the mapped path without QEMU
    pub(crate) fn memfd_with(data: &[u8]) -> OwnedFd {
        let name = CString::new("vmdisplay-test").unwrap();
        // SAFETY: memfd_create with a valid name; result checked.
        let raw = unsafe { libc::memfd_create(name.as_ptr(), 0) };
        assert!(raw >= 0, "memfd_create failed");
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let rc = unsafe { libc::ftruncate(raw, data.len() as libc::off_t) };
        assert_eq!(rc, 0, "ftruncate failed");
        let written =
            unsafe { libc::pwrite(raw, data.as_ptr() as *const libc::c_void, data.len(), 0) };
        assert_eq!(written, data.len() as isize, "pwrite failed");
        fd
    }

    /// True if `raw` still names an open descriptor in this process
    pub(crate) fn fd_is_open(raw: i32) -> bool {
        // SAFETY: F_GETFD on an arbitrary fd number is harmless.
        unsafe { libc::fcntl(raw, libc::F_GETFD) != -1 }
    }

    #[test]
    fn test_mapped_buffer_reflects_fd_contents() {
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let fd = memfd_with(&data);
        let buf = SharedBuffer::map(fd, 0, 2, 1, 8, crate::pixel::PIXMAN_X8R8G8B8).unwrap();
        match buf.kind() {
            BufferKind::Mapped { map, .. } => assert_eq!(map.as_slice(), &data),
            BufferKind::DmaBuf { .. } => panic!("wrong kind"),
        }
    }

    #[test]
    fn test_drop_closes_descriptor_once() {
        let fd = memfd_with(&[0u8; 16]);
        let raw = fd.as_raw_fd();
        let buf = SharedBuffer::map(fd, 0, 4, 1, 16, crate::pixel::PIXMAN_X8R8G8B8).unwrap();
        assert!(fd_is_open(raw));
        drop(buf);
        assert!(!fd_is_open(raw));
    }

    #[test]
    fn test_mapping_respects_offset() {
        let mut data = vec![0u8; 12];
        data[4..].copy_from_slice(&[9, 9, 9, 9, 8, 8, 8, 8]);
        let fd = memfd_with(&data);
        let buf = SharedBuffer::map(fd, 4, 2, 1, 8, crate::pixel::PIXMAN_X8R8G8B8).unwrap();
        match buf.kind() {
            BufferKind::Mapped { map, offset, .. } => {
                assert_eq!(&map.as_slice()[*offset..], &data[4..]);
            }
            BufferKind::DmaBuf { .. } => panic!("wrong kind"),
        }
    }
}
