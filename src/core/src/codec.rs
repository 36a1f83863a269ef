//! Per-layer RLE codec with the CTB stream cipher.
//!
//! Layer payloads are an opcode stream over 7-bit greyscale codes. A code
//! byte with the high bit clear is a single pixel; with the high bit set it
//! is followed by a variable-length run count tagged in its top bits
//! (`0` 7-bit, `10` 14-bit, `110` 21-bit, `1110` 28-bit, anything above is
//! reserved). Codes widen to 8-bit display values as `(code << 1) | 1`;
//! code 0 runs zeros.
//!
//! Decoding is deliberately forgiving: the output is zero-filled up front,
//! runs clamp at the pixel count, and a truncated or malformed stream simply
//! stops decoding, leaving the remainder dark. That keeps the output
//! deterministic for any input bytes.

use crate::error::{Error, Result};
use crate::reader::EncodedLayer;

/// A decoded 8-bit greyscale bitmap for one layer.
#[derive(Clone, Debug)]
pub struct GreyLayer {
    /// Layer index this bitmap was decoded from.
    pub index: u32,
    /// Width in source subpixels.
    pub width: u32,
    /// Height in rows.
    pub height: u32,
    /// Row-major pixel buffer, `width * height` bytes.
    pub pixels: Vec<u8>,
}

/// The evolving XOR keystream applied to encrypted CTB payloads.
///
/// The 32-bit key seeds from the file key and the layer index; each payload
/// byte XORs with the current key's low byte, and the key advances by a
/// fixed increment after every fourth byte consumed.
#[derive(Clone, Copy, Debug)]
pub struct Keystream {
    key: u32,
    step: u32,
    consumed: u32,
}

impl Keystream {
    /// Build the keystream for `layer_index` of a file with `file_key`.
    pub fn new(file_key: u32, layer_index: u32) -> Keystream {
        let step = file_key
            .wrapping_mul(0x2d83_cdac)
            .wrapping_add(0xd8a8_3423);
        let key = layer_index
            .wrapping_mul(0x1e15_30cd)
            .wrapping_add(0xec3d_47cd)
            .wrapping_mul(step);
        Keystream {
            key,
            step,
            consumed: 0,
        }
    }

    /// Mask for the next payload byte.
    pub fn next_mask(&mut self) -> u8 {
        let mask = self.key as u8;
        self.consumed += 1;
        if self.consumed == 4 {
            self.consumed = 0;
            self.key = self.key.wrapping_add(self.step);
        }
        mask
    }
}

/// Byte cursor over an encoded payload, deciphering on the fly.
///
/// Keeping the cipher inside the read primitive means the RLE state machine
/// above it never sees ciphertext, and the keystream can be tested on its
/// own.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    cipher: Option<Keystream>,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8], file_key: u32, layer_index: u32) -> ByteReader<'a> {
        let cipher = if file_key == 0 {
            None
        } else {
            Some(Keystream::new(file_key, layer_index))
        };
        ByteReader {
            data,
            pos: 0,
            cipher,
        }
    }

    fn next(&mut self) -> Option<u8> {
        let raw = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(match self.cipher.as_mut() {
            Some(ks) => raw ^ ks.next_mask(),
            None => raw,
        })
    }
}

/// Decode an encoded payload into `pixels`, which is zero-filled first.
///
/// Never fails: whatever decodes before the stream ends (or turns invalid)
/// stays, the rest remains zero.
pub fn decode_into(data: &[u8], file_key: u32, layer_index: u32, pixels: &mut [u8]) {
    for p in pixels.iter_mut() {
        *p = 0;
    }
    let cap = pixels.len();
    let mut reader = ByteReader::new(data, file_key, layer_index);
    let mut pos = 0usize;

    while pos < cap {
        let op = match reader.next() {
            Some(b) => b,
            None => break,
        };
        let (code, run) = if op & 0x80 == 0 {
            (op, 1usize)
        } else {
            let code = op & 0x7f;
            let run = match read_run(&mut reader) {
                Some(r) => r,
                None => break,
            };
            (code, run)
        };
        let run = run.min(cap - pos);
        if code != 0 {
            let value = (code << 1) | 1;
            for p in &mut pixels[pos..pos + run] {
                *p = value;
            }
        }
        pos += run;
    }
}

/// Read the 1/2/3/4-byte run count following a run opcode.
fn read_run(reader: &mut ByteReader<'_>) -> Option<usize> {
    let s0 = reader.next()? as usize;
    if s0 & 0x80 == 0 {
        Some(s0)
    } else if s0 & 0xc0 == 0x80 {
        let s1 = reader.next()? as usize;
        Some(((s0 & 0x3f) << 8) | s1)
    } else if s0 & 0xe0 == 0xc0 {
        let s1 = reader.next()? as usize;
        let s2 = reader.next()? as usize;
        Some(((s0 & 0x1f) << 16) | (s1 << 8) | s2)
    } else if s0 & 0xf0 == 0xe0 {
        let s1 = reader.next()? as usize;
        let s2 = reader.next()? as usize;
        let s3 = reader.next()? as usize;
        Some(((s0 & 0x0f) << 24) | (s1 << 16) | (s2 << 8) | s3)
    } else {
        // Reserved tag; treat as end of stream.
        None
    }
}

/// Decode one layer into a freshly allocated [`GreyLayer`].
pub fn decode(layer: &EncodedLayer<'_>, width: u32, height: u32) -> Result<GreyLayer> {
    let len = width as usize * height as usize;
    let mut pixels = Vec::new();
    pixels
        .try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory(len))?;
    pixels.resize(len, 0);
    decode_into(layer.data, layer.key, layer.index, &mut pixels);
    Ok(GreyLayer {
        index: layer.index,
        width,
        height,
        pixels,
    })
}

const MAX_RUN: usize = (1 << 28) - 1;

/// Reference encoder producing the opcode stream [`decode_into`] consumes.
///
/// Greedy longest-run over equal 8-bit values; codes quantise by `value >> 1`
/// (the format's 7-bit precision), so only values of the form `(c << 1) | 1`
/// and zero survive a round trip unchanged. With a non-zero `file_key` the
/// output is ciphered with the layer's keystream.
pub fn encode(pixels: &[u8], file_key: u32, layer_index: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < pixels.len() {
        let value = pixels[i];
        let mut run = 1usize;
        while i + run < pixels.len() && pixels[i + run] == value {
            run += 1;
        }
        let code = value >> 1;
        let mut remaining = run;
        while remaining > 0 {
            let chunk = remaining.min(MAX_RUN);
            push_run(&mut out, code, chunk);
            remaining -= chunk;
        }
        i += run;
    }
    if file_key != 0 {
        let mut ks = Keystream::new(file_key, layer_index);
        for b in out.iter_mut() {
            *b ^= ks.next_mask();
        }
    }
    out
}

fn push_run(out: &mut Vec<u8>, code: u8, run: usize) {
    if run == 1 {
        out.push(code & 0x7f);
        return;
    }
    out.push(0x80 | (code & 0x7f));
    if run < 1 << 7 {
        out.push(run as u8);
    } else if run < 1 << 14 {
        out.push(0x80 | (run >> 8) as u8);
        out.push(run as u8);
    } else if run < 1 << 21 {
        out.push(0xc0 | (run >> 16) as u8);
        out.push((run >> 8) as u8);
        out.push(run as u8);
    } else {
        out.push(0xe0 | (run >> 24) as u8);
        out.push((run >> 16) as u8);
        out.push((run >> 8) as u8);
        out.push(run as u8);
    }
}
