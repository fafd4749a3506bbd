//! Authoritative frame buffer
//!
//! Holds the current guest frame as an interleaved RGB plane. The D-Bus
//! dispatch context is the only writer; the consumer side never sees the
//! live plane, it takes snapshot copies gated by the dirty flag.

use thiserror::Error;
use tracing::info;

/// A partial-update rectangle in buffer coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// True if the region lies fully inside a `width` x `height` buffer
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x.checked_add(self.width).is_some_and(|r| r <= width)
            && self.y.checked_add(self.height).is_some_and(|b| b <= height)
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("region ({x},{y}) {width}x{height} exceeds buffer {buf_width}x{buf_height}")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        buf_width: u32,
        buf_height: u32,
    },

    #[error("plane size mismatch: got {got} bytes, buffer holds {expected}")]
    SizeMismatch { got: usize, expected: usize },
}

/// An independent copy of the frame, safe to hand to another thread
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub generation: u64,
}

/// The current-frame store with full/partial update semantics
pub struct FrameBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
    generation: u64,
    dirty: bool,
}

impl FrameBuffer {
    /// Create a zero-filled buffer (placeholder dimensions before first contact)
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width as usize * height as usize * 3],
            generation: 0,
            dirty: false,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reallocate and zero-fill; no-op when the dimensions already match
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == self.width && height == self.height {
            return;
        }
        info!(
            "Resizing frame buffer: {}x{} -> {}x{}",
            self.width, self.height, width, height
        );
        self.width = width;
        self.height = height;
        self.data = vec![0u8; width as usize * height as usize * 3];
        self.mark_mutated();
    }

    /// Replace the whole plane; `rgb` must match the current dimensions
    pub fn write_full(&mut self, rgb: &[u8]) -> Result<(), UpdateError> {
        if rgb.len() != self.data.len() {
            return Err(UpdateError::SizeMismatch {
                got: rgb.len(),
                expected: self.data.len(),
            });
        }
        self.data.copy_from_slice(rgb);
        self.mark_mutated();
        Ok(())
    }

    /// Copy `rgb` into a sub-rectangle; rejected without mutation when out of bounds
    pub fn write_region(&mut self, region: Region, rgb: &[u8]) -> Result<(), UpdateError> {
        if !region.fits_within(self.width, self.height) {
            return Err(UpdateError::OutOfBounds {
                x: region.x,
                y: region.y,
                width: region.width,
                height: region.height,
                buf_width: self.width,
                buf_height: self.height,
            });
        }
        let patch_row = region.width as usize * 3;
        let expected = patch_row * region.height as usize;
        if rgb.len() != expected {
            return Err(UpdateError::SizeMismatch {
                got: rgb.len(),
                expected,
            });
        }

        let buf_row = self.width as usize * 3;
        for dy in 0..region.height as usize {
            let dst = (region.y as usize + dy) * buf_row + region.x as usize * 3;
            let src = dy * patch_row;
            self.data[dst..dst + patch_row].copy_from_slice(&rgb[src..src + patch_row]);
        }
        self.mark_mutated();
        Ok(())
    }

    /// Take an independent copy of the current plane
    pub fn snapshot(&self) -> FrameSnapshot {
        FrameSnapshot {
            width: self.width,
            height: self.height,
            data: self.data.clone(),
            generation: self.generation,
        }
    }

    /// Returns whether a mutation happened since the last call, clearing the flag
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    #[cfg(test)]
    pub fn plane(&self) -> &[u8] {
        &self.data
    }

    fn mark_mutated(&mut self) {
        self.generation += 1;
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(width: u32, height: u32, byte: u8) -> Vec<u8> {
        vec![byte; width as usize * height as usize * 3]
    }

    #[test]
    fn test_write_region_touches_only_target_rect() {
        let mut fb = FrameBuffer::new(4, 4);
        fb.write_full(&filled(4, 4, 0x10)).unwrap();
        let before = fb.snapshot();

        let region = Region {
            x: 1,
            y: 2,
            width: 2,
            height: 1,
        };
        fb.write_region(region, &filled(2, 1, 0xee)).unwrap();

        let after = fb.snapshot();
        for y in 0..4u32 {
            for x in 0..4u32 {
                let i = (y as usize * 4 + x as usize) * 3;
                let inside = x >= 1 && x < 3 && y == 2;
                let expect = if inside { 0xee } else { 0x10 };
                assert_eq!(after.data[i], expect, "pixel ({x},{y})");
                if !inside {
                    assert_eq!(after.data[i], before.data[i]);
                }
            }
        }
    }

    #[test]
    fn test_out_of_bounds_region_leaves_buffer_unchanged() {
        let mut fb = FrameBuffer::new(2, 1);
        fb.write_full(&filled(2, 1, 0x42)).unwrap();
        let before = fb.snapshot();

        let region = Region {
            x: 1,
            y: 0,
            width: 2,
            height: 1,
        };
        let err = fb.write_region(region, &filled(2, 1, 0xff)).unwrap_err();
        assert!(matches!(err, UpdateError::OutOfBounds { .. }));
        assert_eq!(fb.plane(), &before.data[..]);
        assert_eq!(fb.generation(), before.generation);
    }

    #[test]
    fn test_region_overflow_is_out_of_bounds_not_panic() {
        let mut fb = FrameBuffer::new(16, 16);
        let region = Region {
            x: u32::MAX,
            y: 0,
            width: 2,
            height: 1,
        };
        assert!(fb.write_region(region, &filled(2, 1, 0)).is_err());
    }

    #[test]
    fn test_dirty_flag_clears_on_take() {
        let mut fb = FrameBuffer::new(2, 2);
        fb.write_full(&filled(2, 2, 1)).unwrap();
        assert!(fb.take_dirty());
        assert!(!fb.take_dirty());
    }

    #[test]
    fn test_mutations_coalesce_into_one_dirty_transition() {
        let mut fb = FrameBuffer::new(2, 2);
        fb.write_full(&filled(2, 2, 1)).unwrap();
        fb.write_full(&filled(2, 2, 2)).unwrap();
        fb.write_full(&filled(2, 2, 3)).unwrap();

        assert!(fb.take_dirty());
        let snap = fb.snapshot();
        assert_eq!(snap.data, filled(2, 2, 3));
        assert!(!fb.take_dirty());
    }

    #[test]
    fn test_resize_reallocates_and_zero_fills() {
        let mut fb = FrameBuffer::new(2, 2);
        fb.write_full(&filled(2, 2, 9)).unwrap();
        fb.resize(3, 1);
        assert_eq!(fb.width(), 3);
        assert_eq!(fb.height(), 1);
        assert_eq!(fb.plane(), &filled(3, 1, 0)[..]);
    }

    #[test]
    fn test_write_full_rejects_mismatched_plane() {
        let mut fb = FrameBuffer::new(2, 2);
        let err = fb.write_full(&filled(3, 3, 0)).unwrap_err();
        assert!(matches!(err, UpdateError::SizeMismatch { .. }));
    }
}
