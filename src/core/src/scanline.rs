//! Greyscale-to-panel scanline building.
//!
//! Maps a decoded layer's subpixel rows onto the target panel's pixel rows,
//! inserts the PNG filter byte per row and applies the Up filter in place.
//! This is the CPU reference implementation; accelerator kernels must match
//! it byte for byte.

use crate::accel::FrameDims;
use crate::codec::GreyLayer;
use crate::error::{Error, Result};

/// PNG filter type applied to every row.
pub const FILTER_UP: u8 = 2;

/// A PNG-ready filtered row block for one layer.
#[derive(Clone, Debug)]
pub struct Scanlines {
    /// Output pixels per row.
    pub out_width: u32,
    /// Rows.
    pub height: u32,
    /// Channels per pixel (3 = RGB, 1 = greyscale).
    pub channels: u32,
    /// `height * (1 + out_width * channels)` bytes: filter byte plus data
    /// per row, Up-filtered.
    pub data: Vec<u8>,
}

#[inline]
fn src_at(row: &[u8], sub: i64) -> u8 {
    if sub >= 0 && (sub as usize) < row.len() {
        row[sub as usize]
    } else {
        0
    }
}

/// Build filtered scanlines for one layer into `out`, which must be exactly
/// `dims.scanline_len()` bytes. `grey` is the layer's row-major subpixel
/// buffer of `dims.grey_len()` bytes.
pub fn build_into(grey: &[u8], dims: &FrameDims, out: &mut [u8]) {
    debug_assert_eq!(grey.len(), dims.grey_len());
    debug_assert_eq!(out.len(), dims.scanline_len());

    let stride = dims.row_stride();
    let src_w = dims.src_w as usize;
    let out_width = dims.out_width as usize;
    let pad = i64::from(dims.pad_left);

    // Raw remap pass.
    for y in 0..dims.height as usize {
        let srow = &grey[y * src_w..(y + 1) * src_w];
        let orow = &mut out[y * stride..(y + 1) * stride];
        orow[0] = FILTER_UP;
        match dims.channels {
            3 => {
                for x in 0..out_width {
                    let base = (x * 3) as i64 - pad;
                    orow[1 + x * 3] = src_at(srow, base);
                    orow[2 + x * 3] = src_at(srow, base + 1);
                    orow[3 + x * 3] = src_at(srow, base + 2);
                }
            }
            _ => {
                for x in 0..out_width {
                    let base = (x * 2) as i64 - pad;
                    let a = u16::from(src_at(srow, base));
                    let b = u16::from(src_at(srow, base + 1));
                    orow[1 + x] = ((a + b) >> 1) as u8;
                }
            }
        }
    }

    // Up filter, bottom-up so each row still sees the raw previous row.
    // Row 0 filters against an implicit zero row and stays as-is.
    for y in (1..dims.height as usize).rev() {
        let (head, tail) = out.split_at_mut(y * stride);
        let prev = &head[(y - 1) * stride..];
        let cur = &mut tail[..stride];
        for i in 1..stride {
            cur[i] = cur[i].wrapping_sub(prev[i]);
        }
    }
}

/// Build filtered scanlines for one layer into a fresh buffer.
pub fn build(layer: &GreyLayer, dims: &FrameDims) -> Result<Scanlines> {
    let len = dims.scanline_len();
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory(len))?;
    data.resize(len, 0);
    build_into(&layer.pixels, dims, &mut data);
    Ok(Scanlines {
        out_width: dims.out_width,
        height: dims.height,
        channels: dims.channels,
        data,
    })
}

/// Undo the Up filter, recovering raw rows (without filter bytes). Used by
/// tests and the autotune benchmark to check kernel equivalence end to end.
pub fn unfilter(data: &[u8], dims: &FrameDims) -> Vec<u8> {
    let stride = dims.row_stride();
    let width = stride - 1;
    let mut raw = vec![0u8; width * dims.height as usize];
    for y in 0..dims.height as usize {
        for i in 0..width {
            let above = if y == 0 { 0 } else { raw[(y - 1) * width + i] };
            raw[y * width + i] = data[y * stride + 1 + i].wrapping_add(above);
        }
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::TargetProfile;

    fn grey(dims: &FrameDims, f: impl Fn(usize, usize) -> u8) -> GreyLayer {
        let mut pixels = vec![0u8; dims.grey_len()];
        for y in 0..dims.height as usize {
            for x in 0..dims.src_w as usize {
                pixels[y * dims.src_w as usize + x] = f(x, y);
            }
        }
        GreyLayer {
            index: 0,
            width: dims.src_w,
            height: dims.height,
            pixels,
        }
    }

    #[test]
    fn buffer_length_is_exact() {
        let profile = TargetProfile::rgb8("t", 16, 50.0, 0.0);
        let dims = FrameDims::new(48, 4, &profile);
        let s = build(&grey(&dims, |_, _| 0), &dims).unwrap();
        assert_eq!(s.data.len(), 4 * (1 + 16 * 3));
    }

    #[test]
    fn rgb_maps_three_subpixels_per_pixel() {
        let profile = TargetProfile::rgb8("t", 4, 50.0, 0.0);
        let dims = FrameDims::new(12, 1, &profile);
        let s = build(&grey(&dims, |x, _| x as u8 + 1), &dims).unwrap();
        // Single row: filter byte then identity mapping.
        assert_eq!(s.data[0], FILTER_UP);
        assert_eq!(&s.data[1..], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn rgb_padding_is_centered_and_zero_filled() {
        // 4 output pixels = 12 subpixel slots, 6 source subpixels -> pad 3.
        let profile = TargetProfile::rgb8("t", 4, 50.0, 0.0);
        let dims = FrameDims::new(6, 1, &profile);
        assert_eq!(dims.pad_left, 3);
        let s = build(&grey(&dims, |x, _| 10 * (x as u8 + 1)), &dims).unwrap();
        assert_eq!(&s.data[1..], &[0, 0, 0, 10, 20, 30, 40, 50, 60, 0, 0, 0]);
    }

    #[test]
    fn grey_averages_subpixel_pairs() {
        let profile = TargetProfile::grey3("t", 4, 50.0, 0.0);
        let dims = FrameDims::new(8, 1, &profile);
        let vals = [10u8, 20, 7, 8, 0, 255, 1, 2];
        let s = build(&grey(&dims, |x, _| vals[x]), &dims).unwrap();
        assert_eq!(&s.data[1..], &[15, 7, 127, 1]);
    }

    #[test]
    fn grey_odd_width_pads_and_zero_extends() {
        // 3 output pixels = 6 subpixel slots, 5 source subpixels -> pad 0
        // (floor((6 - 5) / 2)); the final pair reads one real subpixel and
        // one implicit zero.
        let profile = TargetProfile::grey3("t", 3, 50.0, 0.0);
        let dims = FrameDims::new(5, 1, &profile);
        assert_eq!(dims.pad_left, 0);
        let s = build(&grey(&dims, |x, _| (x as u8 + 1) * 2), &dims).unwrap();
        assert_eq!(&s.data[1..], &[3, 7, 5]);
    }

    #[test]
    fn up_filter_rows_and_round_trip() {
        let profile = TargetProfile::rgb8("t", 2, 50.0, 0.0);
        let dims = FrameDims::new(6, 3, &profile);
        let layer = grey(&dims, |x, y| (10 * y + x) as u8);
        let s = build(&layer, &dims).unwrap();

        let stride = dims.row_stride();
        for y in 0..3 {
            assert_eq!(s.data[y * stride], FILTER_UP);
        }
        // Row 0 is raw (implicit zero row above).
        assert_eq!(&s.data[1..stride], &[0, 1, 2, 3, 4, 5]);
        // Rows below hold the delta to the row above: 10 per row here.
        assert_eq!(&s.data[stride + 1..2 * stride], &[10; 6]);
        assert_eq!(&s.data[2 * stride + 1..], &[10; 6]);

        // Unfilter recovers the raw remap.
        let raw = unfilter(&s.data, &dims);
        assert_eq!(&raw[..6], &[0, 1, 2, 3, 4, 5]);
        assert_eq!(&raw[6..12], &[10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn filter_wraps_mod_256() {
        let profile = TargetProfile::grey3("t", 1, 50.0, 0.0);
        let dims = FrameDims::new(2, 2, &profile);
        // Row 0 brighter than row 1: the delta wraps.
        let layer = grey(&dims, |_, y| if y == 0 { 200 } else { 10 });
        let s = build(&layer, &dims).unwrap();
        let stride = dims.row_stride();
        assert_eq!(s.data[1], 200);
        assert_eq!(s.data[stride + 1], 10u8.wrapping_sub(200));
    }

    #[test]
    fn build_into_matches_build() {
        let profile = TargetProfile::grey3("t", 8, 50.0, 0.0);
        let dims = FrameDims::new(16, 8, &profile);
        let layer = grey(&dims, |x, y| (x * y % 251) as u8);
        let s = build(&layer, &dims).unwrap();
        let mut buf = vec![0u8; dims.scanline_len()];
        build_into(&layer.pixels, &dims, &mut buf);
        assert_eq!(s.data, buf);
    }
}
