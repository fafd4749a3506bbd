//! Pixel format decoding
//!
//! Converts the raw scanline encodings QEMU emits (pixman tags for the
//! inline/mapped paths, DRM fourcc tags for the DMA-BUF path) into a
//! tightly packed interleaved RGB plane. Pure functions, no state.

use thiserror::Error;

// Pixman format tags (PIXMAN_FORMAT(bpp, type, a, r, g, b) packing)
pub const PIXMAN_X8R8G8B8: u32 = 0x2002_0888;
pub const PIXMAN_A8R8G8B8: u32 = 0x2002_8888;
pub const PIXMAN_R8G8B8: u32 = 0x1802_0888;

// DRM fourcc tags seen on QEMU GL scanouts. QEMU fills these buffers with
// the same little-endian B,G,R,X byte order as the pixman 32-bit formats,
// so they share a decode path.
pub const FOURCC_XB24: u32 = 0x3432_4258;
pub const FOURCC_AB24: u32 = 0x3432_4241;

/// Normalized pixel layout after tag mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 32-bit packed, bytes B,G,R,X
    Bgrx32,
    /// 32-bit packed, bytes B,G,R,A
    Bgra32,
    /// 24-bit packed, bytes R,G,B
    Rgb24,
}

impl PixelFormat {
    /// Map a pixman format tag, `None` for anything QEMU does not emit
    pub fn from_pixman(tag: u32) -> Option<Self> {
        match tag {
            PIXMAN_X8R8G8B8 => Some(Self::Bgrx32),
            PIXMAN_A8R8G8B8 => Some(Self::Bgra32),
            PIXMAN_R8G8B8 => Some(Self::Rgb24),
            _ => None,
        }
    }

    /// Map a DRM fourcc tag
    pub fn from_fourcc(tag: u32) -> Option<Self> {
        match tag {
            FOURCC_XB24 => Some(Self::Bgrx32),
            FOURCC_AB24 => Some(Self::Bgra32),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgrx32 | Self::Bgra32 => 4,
            Self::Rgb24 => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported pixel format tag 0x{0:08x}")]
    UnsupportedFormat(u32),

    #[error("stride {stride} is smaller than {width} pixels x {bpp} bytes")]
    InvalidStride { stride: u32, width: u32, bpp: usize },

    #[error("pixel data truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
}

/// Decode pixman-tagged scanline data into an RGB plane of `height * width * 3` bytes.
pub fn decode_pixman(
    data: &[u8],
    width: u32,
    height: u32,
    stride: u32,
    tag: u32,
) -> Result<Vec<u8>, DecodeError> {
    let format = PixelFormat::from_pixman(tag).ok_or(DecodeError::UnsupportedFormat(tag))?;
    decode(data, width, height, stride, format)
}

/// Decode fourcc-tagged scanline data into an RGB plane.
pub fn decode_fourcc(
    data: &[u8],
    width: u32,
    height: u32,
    stride: u32,
    tag: u32,
) -> Result<Vec<u8>, DecodeError> {
    let format = PixelFormat::from_fourcc(tag).ok_or(DecodeError::UnsupportedFormat(tag))?;
    decode(data, width, height, stride, format)
}

/// Decode scanline data with a resolved format.
///
/// Rows are `stride` bytes apart; only `width * bpp` of each row is pixel
/// data, the rest is padding. The final row is allowed to omit the padding.
pub fn decode(
    data: &[u8],
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
) -> Result<Vec<u8>, DecodeError> {
    if width == 0 || height == 0 {
        return Ok(Vec::new());
    }

    let bpp = format.bytes_per_pixel();
    let row_bytes = width as usize * bpp;
    if (stride as usize) < row_bytes {
        return Err(DecodeError::InvalidStride { stride, width, bpp });
    }

    let needed = (height as usize - 1) * stride as usize + row_bytes;
    if data.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            got: data.len(),
        });
    }

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height as usize {
        let row = &data[y * stride as usize..y * stride as usize + row_bytes];
        match format {
            PixelFormat::Bgrx32 | PixelFormat::Bgra32 => {
                for px in row.chunks_exact(4) {
                    rgb.push(px[2]);
                    rgb.push(px[1]);
                    rgb.push(px[0]);
                }
            }
            PixelFormat::Rgb24 => rgb.extend_from_slice(row),
        }
    }

    Ok(rgb)
}

/// Flip an RGB plane vertically in place (for `y0_top = false` scanouts).
pub fn flip_vertical(rgb: &mut [u8], width: u32, height: u32) {
    let row = width as usize * 3;
    if row == 0 || height < 2 {
        return;
    }
    debug_assert_eq!(rgb.len(), row * height as usize);

    let (mut top, mut bottom) = (0usize, height as usize - 1);
    let mut tmp = vec![0u8; row];
    while top < bottom {
        let (a, b) = (top * row, bottom * row);
        tmp.copy_from_slice(&rgb[a..a + row]);
        rgb.copy_within(b..b + row, a);
        rgb[b..b + row].copy_from_slice(&tmp);
        top += 1;
        bottom -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_x8r8g8b8() {
        // 2x1 pixels, stride == width * 4, channel order B,G,R,X
        let data = [0x11, 0x22, 0x33, 0x00, 0x44, 0x55, 0x66, 0x00];
        let rgb = decode_pixman(&data, 2, 1, 8, PIXMAN_X8R8G8B8).unwrap();
        assert_eq!(rgb, vec![0x33, 0x22, 0x11, 0x66, 0x55, 0x44]);
    }

    #[test]
    fn test_decode_with_row_padding() {
        // 1x2 pixels, stride 8 (4 bytes padding per row)
        let data = [
            0x01, 0x02, 0x03, 0xff, 0xaa, 0xaa, 0xaa, 0xaa, // row 0 + padding
            0x04, 0x05, 0x06, 0xff, // row 1, no trailing padding
        ];
        let rgb = decode_pixman(&data, 1, 2, 8, PIXMAN_A8R8G8B8).unwrap();
        assert_eq!(rgb, vec![0x03, 0x02, 0x01, 0x06, 0x05, 0x04]);
    }

    #[test]
    fn test_decode_rgb24_passthrough() {
        let data = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        let rgb = decode_pixman(&data, 2, 1, 6, PIXMAN_R8G8B8).unwrap();
        assert_eq!(rgb, data.to_vec());
    }

    #[test]
    fn test_fourcc_matches_pixman_layout() {
        let data = [0x11, 0x22, 0x33, 0x00];
        let a = decode_fourcc(&data, 1, 1, 4, FOURCC_XB24).unwrap();
        let b = decode_pixman(&data, 1, 1, 4, PIXMAN_X8R8G8B8).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = decode_pixman(&[0; 4], 1, 1, 4, 0xdead_beef).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedFormat(0xdead_beef)));
    }

    #[test]
    fn test_stride_smaller_than_row_rejected() {
        let err = decode_pixman(&[0; 16], 2, 2, 4, PIXMAN_X8R8G8B8).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidStride { stride: 4, .. }));
    }

    #[test]
    fn test_truncated_data_rejected() {
        let err = decode_pixman(&[0; 7], 2, 1, 8, PIXMAN_X8R8G8B8).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { needed: 8, got: 7 }));
    }

    #[test]
    fn test_zero_dimensions_yield_empty_plane() {
        assert!(decode_pixman(&[], 0, 4, 0, PIXMAN_X8R8G8B8)
            .unwrap()
            .is_empty());
        assert!(decode_pixman(&[], 4, 0, 16, PIXMAN_X8R8G8B8)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_flip_vertical_reverses_rows() {
        // 1x3 plane: rows r0, r1, r2
        let mut rgb = vec![1, 1, 1, 2, 2, 2, 3, 3, 3];
        flip_vertical(&mut rgb, 1, 3);
        assert_eq!(rgb, vec![3, 3, 3, 2, 2, 2, 1, 1, 1]);
    }

    #[test]
    fn test_decode_order_randomized_channels() {
        // Every decoded pixel must be the source bytes reordered B,G,R,X -> R,G,B
        let w = 5u32;
        let h = 3u32;
        let stride = w * 4 + 4;
        let mut data = vec![0u8; (h * stride) as usize];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(31).wrapping_add(7);
        }
        let rgb = decode_pixman(&data, w, h, stride, PIXMAN_X8R8G8B8).unwrap();
        assert_eq!(rgb.len(), (w * h * 3) as usize);
        for y in 0..h as usize {
            for x in 0..w as usize {
                let src = y * stride as usize + x * 4;
                let dst = (y * w as usize + x) * 3;
                assert_eq!(rgb[dst], data[src + 2]);
                assert_eq!(rgb[dst + 1], data[src + 1]);
                assert_eq!(rgb[dst + 2], data[src]);
            }
        }
    }
}
