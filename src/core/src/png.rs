//! PNG container writing and IDAT recompression.
//!
//! Layer images are minimal PNGs: signature, IHDR, one IDAT holding the
//! zlib-deflated filtered scanlines, IEND. No ancillary chunks, 8-bit depth,
//! colour type 2 (RGB) or 0 (greyscale). The recompressor re-deflates an
//! existing PNG's image stream at a different level without touching the
//! IHDR, which is how the speed-first encode level gets tightened when the
//! policy asks for smaller archives.

use crc::crc32::{self, Hasher32};
use miniz_oxide::deflate::compress_to_vec_zlib;
use miniz_oxide::inflate::decompress_to_vec_zlib;

use crate::error::{Error, Result};
use crate::options::{PngLevel, RecompressMode};
use crate::scanline::Scanlines;

/// The 8-byte PNG signature.
pub const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

const IHDR_LEN: usize = 13;

fn chunk_crc(ctype: &[u8; 4], data: &[u8]) -> u32 {
    let mut digest = crc32::Digest::new(crc32::IEEE);
    digest.write(ctype);
    digest.write(data);
    digest.sum32()
}

fn write_chunk(out: &mut Vec<u8>, ctype: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(ctype);
    out.extend_from_slice(data);
    out.extend_from_slice(&chunk_crc(ctype, data).to_be_bytes());
}

/// Wrap filtered scanlines into a complete PNG file at the given level.
pub fn encode(scanlines: &Scanlines, level: PngLevel) -> Vec<u8> {
    encode_raw(
        &scanlines.data,
        scanlines.out_width,
        scanlines.height,
        scanlines.channels,
        level,
    )
}

/// [`encode`] over a bare filtered-scanline slice, for callers that keep
/// many layers in one contiguous buffer.
pub fn encode_raw(
    data: &[u8],
    out_width: u32,
    height: u32,
    channels: u32,
    level: PngLevel,
) -> Vec<u8> {
    let color_type: u8 = if channels == 3 { 2 } else { 0 };
    let idat = compress_to_vec_zlib(data, level.resolve());

    let mut ihdr = [0u8; IHDR_LEN];
    ihdr[0..4].copy_from_slice(&out_width.to_be_bytes());
    ihdr[4..8].copy_from_slice(&height.to_be_bytes());
    ihdr[8] = 8; // bit depth
    ihdr[9] = color_type;
    // compression, filter, interlace all zero

    let mut out = Vec::with_capacity(SIGNATURE.len() + idat.len() + 64);
    out.extend_from_slice(&SIGNATURE);
    write_chunk(&mut out, b"IHDR", &ihdr);
    write_chunk(&mut out, b"IDAT", &idat);
    write_chunk(&mut out, b"IEND", &[]);
    out
}

/// A chunk located inside a parsed PNG: type plus the data extent.
struct RawChunk {
    ctype: [u8; 4],
    start: usize,
    len: usize,
}

fn parse_chunks(png: &[u8]) -> Result<Vec<RawChunk>> {
    if png.len() < SIGNATURE.len() || png[..SIGNATURE.len()] != SIGNATURE {
        return Err(Error::InvalidFormat("not a PNG (bad signature)".into()));
    }
    let mut chunks = Vec::new();
    let mut pos = SIGNATURE.len();
    while pos < png.len() {
        if pos + 8 > png.len() {
            return Err(Error::InvalidFormat("truncated PNG chunk header".into()));
        }
        let len = u32::from_be_bytes([png[pos], png[pos + 1], png[pos + 2], png[pos + 3]]) as usize;
        let mut ctype = [0u8; 4];
        ctype.copy_from_slice(&png[pos + 4..pos + 8]);
        let start = pos + 8;
        let end = start + len + 4; // data + crc
        if end > png.len() {
            return Err(Error::InvalidFormat("truncated PNG chunk data".into()));
        }
        chunks.push(RawChunk { ctype, start, len });
        pos = end;
        if &ctype == b"IEND" {
            break;
        }
    }
    Ok(chunks)
}

/// Re-deflate a PNG's image stream at `target_level`, preserving the IHDR
/// exactly and emitting a single IDAT.
///
/// Accepts only what this pipeline can produce or pass through: bit depth 8
/// and colour types 0, 2, 4 or 6, one image per file.
pub fn recompress(png: &[u8], target_level: u8) -> Result<Vec<u8>> {
    let chunks = parse_chunks(png)?;

    let ihdr = match chunks.first() {
        Some(c) if &c.ctype == b"IHDR" && c.len == IHDR_LEN => c,
        _ => return Err(Error::InvalidFormat("PNG does not start with IHDR".into())),
    };
    if chunks.iter().filter(|c| &c.ctype == b"IHDR").count() > 1 {
        return Err(Error::InvalidFormat("multi-image PNG".into()));
    }
    let ihdr_data = &png[ihdr.start..ihdr.start + ihdr.len];
    let bit_depth = ihdr_data[8];
    let color_type = ihdr_data[9];
    if bit_depth != 8 {
        return Err(Error::InvalidFormat(format!(
            "unsupported bit depth {}",
            bit_depth
        )));
    }
    if !matches!(color_type, 0 | 2 | 4 | 6) {
        return Err(Error::InvalidFormat(format!(
            "unsupported colour type {}",
            color_type
        )));
    }

    let mut stream = Vec::new();
    for c in chunks.iter().filter(|c| &c.ctype == b"IDAT") {
        stream.extend_from_slice(&png[c.start..c.start + c.len]);
    }
    if stream.is_empty() {
        return Err(Error::InvalidFormat("PNG has no IDAT".into()));
    }

    let raw = decompress_to_vec_zlib(&stream)
        .map_err(|e| Error::InvalidFormat(format!("corrupt IDAT stream: {:?}", e.status)))?;
    let idat = compress_to_vec_zlib(&raw, target_level.min(10));

    let mut out = Vec::with_capacity(SIGNATURE.len() + idat.len() + 64);
    out.extend_from_slice(&SIGNATURE);
    write_chunk(&mut out, b"IHDR", ihdr_data);
    write_chunk(&mut out, b"IDAT", &idat);
    write_chunk(&mut out, b"IEND", &[]);
    Ok(out)
}

/// Apply the run's recompression policy to a freshly encoded PNG.
///
/// `Adaptive` only acts when the initial encode was low effort, and both it
/// and `On` keep whichever whole file is smaller; `Force` keeps the
/// recompressed file unconditionally.
pub fn apply_recompress_policy(
    png: Vec<u8>,
    mode: RecompressMode,
    encode_level: PngLevel,
) -> Result<Vec<u8>> {
    let run = match mode {
        RecompressMode::Off => false,
        RecompressMode::On | RecompressMode::Force => true,
        RecompressMode::Adaptive => encode_level.is_low(),
    };
    if !run {
        return Ok(png);
    }
    let tightened = recompress(&png, 9)?;
    if mode == RecompressMode::Force || tightened.len() <= png.len() {
        Ok(tightened)
    } else {
        Ok(png)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::FrameDims;
    use crate::profile::TargetProfile;
    use crate::scanline;

    fn sample_scanlines() -> (Scanlines, FrameDims) {
        let profile = TargetProfile::rgb8("t", 8, 50.0, 0.0);
        let dims = FrameDims::new(24, 6, &profile);
        let grey: Vec<u8> = (0..dims.grey_len()).map(|i| (i * 7 % 253) as u8).collect();
        let mut data = vec![0u8; dims.scanline_len()];
        scanline::build_into(&grey, &dims, &mut data);
        (
            Scanlines {
                out_width: 8,
                height: 6,
                channels: 3,
                data,
            },
            dims,
        )
    }

    fn idat_payload(png: &[u8]) -> Vec<u8> {
        let chunks = parse_chunks(png).unwrap();
        let mut stream = Vec::new();
        for c in chunks.iter().filter(|c| &c.ctype == b"IDAT") {
            stream.extend_from_slice(&png[c.start..c.start + c.len]);
        }
        decompress_to_vec_zlib(&stream).unwrap()
    }

    #[test]
    fn encodes_a_wellformed_container() {
        let (s, _) = sample_scanlines();
        let png = encode(&s, PngLevel::Level(6));
        assert_eq!(&png[..8], &SIGNATURE);

        let chunks = parse_chunks(&png).unwrap();
        let types: Vec<&[u8; 4]> = chunks.iter().map(|c| &c.ctype).collect();
        assert_eq!(types, vec![b"IHDR", b"IDAT", b"IEND"]);

        // Every chunk's stored CRC matches a recomputation.
        for c in &chunks {
            let stored = u32::from_be_bytes([
                png[c.start + c.len],
                png[c.start + c.len + 1],
                png[c.start + c.len + 2],
                png[c.start + c.len + 3],
            ]);
            assert_eq!(stored, chunk_crc(&c.ctype, &png[c.start..c.start + c.len]));
        }

        let ihdr = &png[chunks[0].start..chunks[0].start + 13];
        assert_eq!(u32::from_be_bytes([ihdr[0], ihdr[1], ihdr[2], ihdr[3]]), 8);
        assert_eq!(u32::from_be_bytes([ihdr[4], ihdr[5], ihdr[6], ihdr[7]]), 6);
        assert_eq!(ihdr[8], 8);
        assert_eq!(ihdr[9], 2);
        assert_eq!(&ihdr[10..13], &[0, 0, 0]);
    }

    #[test]
    fn idat_inflates_back_to_the_scanlines() {
        let (s, _) = sample_scanlines();
        let png = encode(&s, PngLevel::Auto);
        assert_eq!(idat_payload(&png), s.data);
    }

    #[test]
    fn greyscale_uses_colour_type_zero() {
        let s = Scanlines {
            out_width: 4,
            height: 2,
            channels: 1,
            data: vec![2, 1, 2, 3, 4, 2, 5, 6, 7, 8],
        };
        let png = encode(&s, PngLevel::Level(1));
        let chunks = parse_chunks(&png).unwrap();
        assert_eq!(png[chunks[0].start + 9], 0);
    }

    #[test]
    fn recompress_preserves_pixels_and_ihdr() {
        let (s, _) = sample_scanlines();
        let png = encode(&s, PngLevel::Level(1));
        let tight = recompress(&png, 9).unwrap();
        assert_eq!(idat_payload(&tight), idat_payload(&png));

        let before = parse_chunks(&png).unwrap();
        let after = parse_chunks(&tight).unwrap();
        assert_eq!(
            &png[before[0].start..before[0].start + 13],
            &tight[after[0].start..after[0].start + 13],
        );
    }

    #[test]
    fn recompress_rejects_foreign_pngs() {
        let (s, _) = sample_scanlines();
        let mut png = encode(&s, PngLevel::Level(1));
        // Flip the bit depth to 16.
        let chunks = parse_chunks(&png).unwrap();
        let depth_at = chunks[0].start + 8;
        png[depth_at] = 16;
        assert!(recompress(&png, 9).is_err());

        assert!(recompress(b"not a png at all", 9).is_err());
    }

    #[test]
    fn adaptive_policy_never_grows_the_file() {
        let (s, _) = sample_scanlines();
        let png = encode(&s, PngLevel::Auto);
        let original_len = png.len();
        let out =
            apply_recompress_policy(png, RecompressMode::Adaptive, PngLevel::Auto).unwrap();
        assert!(out.len() <= original_len);
        let (s2, _) = sample_scanlines();
        assert_eq!(idat_payload(&out), s2.data);
    }

    #[test]
    fn adaptive_policy_skips_high_effort_encodes() {
        let (s, _) = sample_scanlines();
        let png = encode(&s, PngLevel::Level(9));
        let out = apply_recompress_policy(png.clone(), RecompressMode::Adaptive, PngLevel::Level(9))
            .unwrap();
        assert_eq!(out, png);
    }

    #[test]
    fn off_policy_is_identity() {
        let (s, _) = sample_scanlines();
        let png = encode(&s, PngLevel::Level(1));
        let out = apply_recompress_policy(png.clone(), RecompressMode::Off, PngLevel::Level(1))
            .unwrap();
        assert_eq!(out, png);
    }

    #[test]
    fn force_policy_always_rebuilds() {
        let (s, _) = sample_scanlines();
        let png = encode(&s, PngLevel::Level(9));
        let out =
            apply_recompress_policy(png.clone(), RecompressMode::Force, PngLevel::Level(9)).unwrap();
        // Same pixels regardless of which file ended up smaller.
        assert_eq!(idat_payload(&out), idat_payload(&png));
    }
}
