//! Shared fixtures: synthetic CTB containers and archive inspection.

#![allow(dead_code)]

use byteorder::{LittleEndian, WriteBytesExt};

use lith_core::accel::FrameDims;
use lith_core::codec;
use lith_core::scanline;

pub const HEADER_LEN: u32 = 112;
pub const LAYER_ENTRY_LEN: u32 = 36;
pub const MAGIC_CTB: u32 = 0x12FD_0086;

/// Build a CTB v4 container holding the given layer bitmaps.
///
/// Pixel values must already be quantised to the format's 7-bit precision
/// (zero or `(c << 1) | 1`), as [`quantise`] produces.
pub fn build_ctb(width: u32, height: u32, key: u32, layers: &[Vec<u8>]) -> Vec<u8> {
    let payloads: Vec<Vec<u8>> = layers
        .iter()
        .enumerate()
        .map(|(i, pixels)| {
            assert_eq!(pixels.len(), (width * height) as usize);
            codec::encode(pixels, key, i as u32)
        })
        .collect();
    build_ctb_raw(width, height, key, &payloads)
}

/// [`build_ctb`] with caller-supplied raw payload bytes, for malformed-RLE
/// fixtures.
pub fn build_ctb_raw(width: u32, height: u32, key: u32, payloads: &[Vec<u8>]) -> Vec<u8> {
    let table_off = HEADER_LEN;
    let mut data_off = table_off + payloads.len() as u32 * LAYER_ENTRY_LEN;

    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(MAGIC_CTB).unwrap();
    out.write_u32::<LittleEndian>(4).unwrap(); // version
    for _ in 0..3 {
        out.write_f32::<LittleEndian>(0.0).unwrap(); // bed dims
    }
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_f32::<LittleEndian>(payloads.len() as f32 * 0.05).unwrap(); // total height
    out.write_f32::<LittleEndian>(0.05).unwrap(); // layer height
    out.write_f32::<LittleEndian>(2.5).unwrap(); // exposure
    out.write_f32::<LittleEndian>(25.0).unwrap(); // bottom exposure
    out.write_f32::<LittleEndian>(0.5).unwrap(); // light-off delay
    out.write_u32::<LittleEndian>(3).unwrap(); // bottom layers
    out.write_u32::<LittleEndian>(width).unwrap();
    out.write_u32::<LittleEndian>(height).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap(); // large preview
    out.write_u32::<LittleEndian>(table_off).unwrap();
    out.write_u32::<LittleEndian>(payloads.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap(); // small preview
    out.write_u32::<LittleEndian>(1800).unwrap(); // print time
    out.write_u32::<LittleEndian>(1).unwrap(); // projection
    out.write_u32::<LittleEndian>(0).unwrap(); // print params offset
    out.write_u32::<LittleEndian>(0).unwrap(); // print params size
    out.write_u32::<LittleEndian>(1).unwrap(); // anti-alias
    out.write_u16::<LittleEndian>(255).unwrap();
    out.write_u16::<LittleEndian>(255).unwrap();
    out.write_u32::<LittleEndian>(key).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap(); // slicer info offset
    out.write_u32::<LittleEndian>(0).unwrap(); // slicer info size
    assert_eq!(out.len() as u32, HEADER_LEN);

    for (i, payload) in payloads.iter().enumerate() {
        out.write_f32::<LittleEndian>(0.05 * (i + 1) as f32).unwrap();
        out.write_f32::<LittleEndian>(2.5).unwrap();
        out.write_f32::<LittleEndian>(0.5).unwrap();
        out.write_u32::<LittleEndian>(data_off).unwrap();
        out.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        out.extend_from_slice(&[0u8; 16]);
        data_off += payload.len() as u32;
    }
    for payload in payloads {
        out.extend_from_slice(payload);
    }
    out
}

/// Clamp an 8-bit value to what the 7-bit slicer format can carry: zero or
/// `(code << 1) | 1` for a non-zero code.
pub fn quantise(value: u8) -> u8 {
    let code = value >> 1;
    if code == 0 {
        0
    } else {
        (code << 1) | 1
    }
}

/// A bitmap with a solid rectangle, quantised.
pub fn rect_layer(width: u32, height: u32, x0: u32, y0: u32, x1: u32, y1: u32, value: u8) -> Vec<u8> {
    let mut pixels = vec![0u8; (width * height) as usize];
    for y in y0..y1 {
        for x in x0..x1 {
            pixels[(y * width + x) as usize] = quantise(value);
        }
    }
    pixels
}

/// A deterministic pseudo-random quantised bitmap.
pub fn noise_layer(width: u32, height: u32, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9).wrapping_add(1);
    (0..width * height)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            if state & 0x3 == 0 {
                0
            } else {
                quantise((state >> 24) as u8)
            }
        })
        .collect()
}

fn le_u16(d: &[u8], o: usize) -> u16 {
    u16::from_le_bytes([d[o], d[o + 1]])
}

fn le_u32(d: &[u8], o: usize) -> u32 {
    u32::from_le_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]])
}

/// Parse a store-only ZIP through its central directory, returning entries
/// in directory order.
pub fn read_zip(zip: &[u8]) -> Vec<(String, Vec<u8>)> {
    const EOCD_SIG: u32 = 0x0605_4b50;
    const CD_SIG: u32 = 0x0201_4b50;
    const LOCAL_SIG: u32 = 0x0403_4b50;

    assert!(zip.len() >= 22, "too short for a ZIP");
    let mut i = zip.len() - 22;
    loop {
        if le_u32(zip, i) == EOCD_SIG {
            break;
        }
        assert!(i > 0, "no end-of-central-directory record");
        i -= 1;
    }
    let count = le_u16(zip, i + 10) as usize;
    let mut pos = le_u32(zip, i + 16) as usize;

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        assert_eq!(le_u32(zip, pos), CD_SIG, "central directory corrupt");
        let method = le_u16(zip, pos + 10);
        assert_eq!(method, 0, "archive must be store-only");
        let size = le_u32(zip, pos + 20) as usize;
        let name_len = le_u16(zip, pos + 28) as usize;
        let local_offset = le_u32(zip, pos + 42) as usize;
        let name = String::from_utf8(zip[pos + 46..pos + 46 + name_len].to_vec()).unwrap();

        assert_eq!(le_u32(zip, local_offset), LOCAL_SIG, "local header corrupt");
        let local_name_len = le_u16(zip, local_offset + 26) as usize;
        let data_start = local_offset + 30 + local_name_len;
        entries.push((name, zip[data_start..data_start + size].to_vec()));
        pos += 46 + name_len;
    }
    entries
}

/// Inflate a layer PNG's IDAT and undo the Up filter, returning raw rows
/// (without filter bytes).
pub fn png_raw_rows(png: &[u8], dims: &FrameDims) -> Vec<u8> {
    const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    assert_eq!(&png[..8], &SIGNATURE, "bad PNG signature");
    let mut stream = Vec::new();
    let mut pos = 8;
    while pos + 8 <= png.len() {
        let len = u32::from_be_bytes([png[pos], png[pos + 1], png[pos + 2], png[pos + 3]]) as usize;
        let ctype = &png[pos + 4..pos + 8];
        let data = &png[pos + 8..pos + 8 + len];
        if ctype == b"IDAT" {
            stream.extend_from_slice(data);
        }
        pos += 12 + len;
        if ctype == b"IEND" {
            break;
        }
    }
    let filtered = miniz_oxide::inflate::decompress_to_vec_zlib(&stream).expect("valid IDAT");
    assert_eq!(filtered.len(), dims.scanline_len());
    scanline::unfilter(&filtered, dims)
}

/// The PNG's IHDR dimensions `(width, height, color_type)`.
pub fn png_header(png: &[u8]) -> (u32, u32, u8) {
    let ihdr = &png[16..29];
    (
        u32::from_be_bytes([ihdr[0], ihdr[1], ihdr[2], ihdr[3]]),
        u32::from_be_bytes([ihdr[4], ihdr[5], ihdr[6], ihdr[7]]),
        ihdr[9],
    )
}
