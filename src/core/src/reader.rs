//! Slice-file container parsing.
//!
//! Handles the CTB / CBDDLP (Photon) family. The formats share one fixed
//! little-endian header layout; they differ in magic, in which optional
//! blocks are present, and in whether layer payloads are run through the
//! stream cipher (CTB v3+ with a non-zero key). The reader parses the header
//! and the per-layer index eagerly, validates individual layer extents
//! lazily, and never decodes pixel data itself.

use std::fs;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// Magic of a CTB container.
pub const MAGIC_CTB: u32 = 0x12FD_0086;
/// Magic of a CBDDLP / Photon container.
pub const MAGIC_CBDDLP: u32 = 0x12FD_0019;

const HEADER_LEN: u64 = 112;
const LAYER_ENTRY_LEN: u64 = 36;

/// Index entry for one layer: position metadata plus the payload extent.
#[derive(Clone, Copy, Debug)]
pub struct LayerEntry {
    /// Z position of the layer's top surface, millimetres.
    pub z_mm: f32,
    /// Exposure override for this layer, seconds.
    pub exposure_s: f32,
    /// Light-off delay, seconds.
    pub light_off_s: f32,
    data_offset: u32,
    data_length: u32,
}

/// A borrowed view of one layer's raw RLE payload.
///
/// Consumed exactly once by a codec worker; the slice borrows from the
/// owning [`SliceFile`].
#[derive(Clone, Copy, Debug)]
pub struct EncodedLayer<'a> {
    /// Index of the layer in `[0, layer_count)`.
    pub index: u32,
    /// The raw, still-encoded payload bytes.
    pub data: &'a [u8],
    /// File-level cipher key; 0 means the payload is plain.
    pub key: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct PrintParams {
    bottom_lift_height_mm: f32,
    bottom_lift_speed: f32,
    lift_height_mm: f32,
    lift_speed: f32,
    retract_speed: f32,
    volume_ml: f32,
}

#[derive(Clone, Copy, Debug)]
struct Header {
    magic: u32,
    version: u32,
    total_height_mm: f32,
    layer_height_mm: f32,
    exposure_s: f32,
    bottom_exposure_s: f32,
    bottom_layer_count: u32,
    resolution_x: u32,
    resolution_y: u32,
    large_preview_offset: u32,
    layer_table_offset: u32,
    layer_count: u32,
    small_preview_offset: u32,
    print_params_offset: u32,
    print_params_size: u32,
    encryption_key: u32,
}

/// A parsed source container.
///
/// Owns the full source bytes; every accessor is `&self` and the per-layer
/// index is immutable after `open`, so a `SliceFile` can be shared freely
/// across worker threads.
pub struct SliceFile {
    data: Vec<u8>,
    header: Header,
    params: PrintParams,
    layers: Vec<LayerEntry>,
}

impl SliceFile {
    /// Read and parse a slice file from disk.
    pub fn open(path: &Path) -> Result<SliceFile> {
        let data = fs::read(path)?;
        SliceFile::from_bytes(data)
    }

    /// Parse a slice file from an in-memory buffer.
    pub fn from_bytes(data: Vec<u8>) -> Result<SliceFile> {
        let header = parse_header(&data)?;
        let params = parse_print_params(&data, &header);
        let layers = parse_layer_table(&data, &header)?;
        debug!(
            "parsed {} container: v{}, {}x{}, {} layers, key={:#x}",
            if header.magic == MAGIC_CTB { "ctb" } else { "cbddlp" },
            header.version,
            header.resolution_x,
            header.resolution_y,
            header.layer_count,
            header.encryption_key,
        );
        Ok(SliceFile {
            data,
            header,
            params,
            layers,
        })
    }

    /// Source resolution `(width, height)` in subpixels.
    pub fn resolution(&self) -> (u32, u32) {
        (self.header.resolution_x, self.header.resolution_y)
    }

    /// Number of layers in the file.
    pub fn layer_count(&self) -> u32 {
        self.header.layer_count
    }

    /// Number of bottom layers with extended exposure.
    pub fn bottom_layer_count(&self) -> u32 {
        self.header.bottom_layer_count
    }

    /// Slice thickness, millimetres.
    pub fn layer_height_mm(&self) -> f32 {
        self.header.layer_height_mm
    }

    /// Normal-layer exposure, seconds.
    pub fn exposure_s(&self) -> f32 {
        self.header.exposure_s
    }

    /// Bottom-layer exposure, seconds.
    pub fn bottom_exposure_s(&self) -> f32 {
        self.header.bottom_exposure_s
    }

    /// Lift height from the print-parameters block, 0.0 when absent.
    pub fn lift_height_mm(&self) -> f32 {
        self.params.lift_height_mm
    }

    /// Total print height, millimetres. Falls back to `layers x height`
    /// when the header field is zero.
    pub fn print_height_mm(&self) -> f32 {
        if self.header.total_height_mm > 0.0 {
            self.header.total_height_mm
        } else {
            self.header.layer_height_mm * self.header.layer_count as f32
        }
    }

    /// File-level stream-cipher key; 0 means payloads are plain.
    pub fn encryption_key(&self) -> u32 {
        self.header.encryption_key
    }

    /// Positional metadata for layer `i`. Panics on an out-of-range index;
    /// the pipeline only asks for indices below `layer_count`.
    pub fn layer_meta(&self, i: u32) -> &LayerEntry {
        &self.layers[i as usize]
    }

    /// The raw encoded payload of layer `i`.
    ///
    /// Callable in any order and from any thread. The payload extent is
    /// validated here rather than at `open` so a file with one corrupt
    /// entry still converts every layer before it.
    pub fn layer(&self, i: u32) -> Result<EncodedLayer<'_>> {
        let entry = self
            .layers
            .get(i as usize)
            .ok_or_else(|| Error::InvalidFormat(format!("layer {} out of range", i)))?;
        let start = entry.data_offset as usize;
        let end = start + entry.data_length as usize;
        if end > self.data.len() || start > end {
            return Err(Error::InvalidFormat(format!(
                "layer {}: payload [{:#x}..{:#x}] exceeds file length {:#x}",
                i,
                start,
                end,
                self.data.len()
            )));
        }
        Ok(EncodedLayer {
            index: i,
            data: &self.data[start..end],
            key: self.header.encryption_key,
        })
    }

    /// Lazy in-order iterator over encoded layer payloads.
    pub fn iter_layers(&self) -> impl Iterator<Item = Result<EncodedLayer<'_>>> {
        (0..self.header.layer_count).map(move |i| self.layer(i))
    }

    /// Raw bytes of the large preview image, pass-through only.
    pub fn large_preview(&self) -> Option<&[u8]> {
        preview_bytes(&self.data, self.header.large_preview_offset)
    }

    /// Raw bytes of the small preview image, pass-through only.
    pub fn small_preview(&self) -> Option<&[u8]> {
        preview_bytes(&self.data, self.header.small_preview_offset)
    }
}

fn parse_header(data: &[u8]) -> Result<Header> {
    if (data.len() as u64) < HEADER_LEN {
        return Err(Error::InvalidFormat(format!(
            "file too short for a slice header ({} bytes)",
            data.len()
        )));
    }
    let mut c = Cursor::new(data);
    let magic = c.read_u32::<LittleEndian>()?;
    let version = c.read_u32::<LittleEndian>()?;
    match magic {
        MAGIC_CTB if (2..=4).contains(&version) => {}
        MAGIC_CBDDLP if (1..=2).contains(&version) => {}
        MAGIC_CTB | MAGIC_CBDDLP => {
            return Err(Error::InvalidFormat(format!(
                "unsupported container version {}",
                version
            )));
        }
        _ => {
            return Err(Error::InvalidFormat(format!(
                "unrecognised magic {:#010x}",
                magic
            )));
        }
    }

    // Bed dimensions and two reserved words, unused by the conversion.
    c.seek(SeekFrom::Start(28))?;
    let total_height_mm = c.read_f32::<LittleEndian>()?;
    let layer_height_mm = c.read_f32::<LittleEndian>()?;
    let exposure_s = c.read_f32::<LittleEndian>()?;
    let bottom_exposure_s = c.read_f32::<LittleEndian>()?;
    let _light_off_delay_s = c.read_f32::<LittleEndian>()?;
    let bottom_layer_count = c.read_u32::<LittleEndian>()?;
    let resolution_x = c.read_u32::<LittleEndian>()?;
    let resolution_y = c.read_u32::<LittleEndian>()?;
    let large_preview_offset = c.read_u32::<LittleEndian>()?;
    let layer_table_offset = c.read_u32::<LittleEndian>()?;
    let layer_count = c.read_u32::<LittleEndian>()?;
    let small_preview_offset = c.read_u32::<LittleEndian>()?;
    let _print_time_s = c.read_u32::<LittleEndian>()?;
    let _projection = c.read_u32::<LittleEndian>()?;
    let print_params_offset = c.read_u32::<LittleEndian>()?;
    let print_params_size = c.read_u32::<LittleEndian>()?;
    let _anti_alias_level = c.read_u32::<LittleEndian>()?;
    let _light_pwm = c.read_u16::<LittleEndian>()?;
    let _bottom_light_pwm = c.read_u16::<LittleEndian>()?;
    let encryption_key = c.read_u32::<LittleEndian>()?;

    if resolution_x == 0 || resolution_y == 0 {
        return Err(Error::InvalidFormat(format!(
            "degenerate resolution {}x{}",
            resolution_x, resolution_y
        )));
    }
    if layer_height_mm <= 0.0 && layer_count > 0 {
        return Err(Error::InvalidFormat("non-positive layer height".into()));
    }

    // The cipher only exists for CTB v3+; clear the field for anything else
    // so stray header bytes in older files cannot engage it.
    let encryption_key = if magic == MAGIC_CTB && version >= 3 {
        encryption_key
    } else {
        0
    };

    Ok(Header {
        magic,
        version,
        total_height_mm,
        layer_height_mm,
        exposure_s,
        bottom_exposure_s,
        bottom_layer_count,
        resolution_x,
        resolution_y,
        large_preview_offset,
        layer_table_offset,
        layer_count,
        small_preview_offset,
        print_params_offset,
        print_params_size,
        encryption_key,
    })
}

fn parse_print_params(data: &[u8], header: &Header) -> PrintParams {
    // Best effort: an absent or truncated block degrades to zeroed motion
    // parameters rather than failing the conversion.
    let off = header.print_params_offset as usize;
    if off == 0 || header.print_params_size < 24 || off + 24 > data.len() {
        return PrintParams::default();
    }
    let mut c = Cursor::new(&data[off..]);
    let read = |c: &mut Cursor<&[u8]>| c.read_f32::<LittleEndian>().unwrap_or(0.0);
    PrintParams {
        bottom_lift_height_mm: read(&mut c),
        bottom_lift_speed: read(&mut c),
        lift_height_mm: read(&mut c),
        lift_speed: read(&mut c),
        retract_speed: read(&mut c),
        volume_ml: read(&mut c),
    }
}

fn parse_layer_table(data: &[u8], header: &Header) -> Result<Vec<LayerEntry>> {
    let count = header.layer_count as u64;
    if count == 0 {
        return Ok(Vec::new());
    }
    let start = header.layer_table_offset as u64;
    let end = start + count * LAYER_ENTRY_LEN;
    if start < HEADER_LEN || end > data.len() as u64 {
        return Err(Error::InvalidFormat(format!(
            "layer table [{:#x}..{:#x}] exceeds file length {:#x}",
            start,
            end,
            data.len()
        )));
    }
    let mut layers = Vec::with_capacity(header.layer_count as usize);
    let mut c = Cursor::new(&data[start as usize..end as usize]);
    for _ in 0..header.layer_count {
        let z_mm = c.read_f32::<LittleEndian>()?;
        let exposure_s = c.read_f32::<LittleEndian>()?;
        let light_off_s = c.read_f32::<LittleEndian>()?;
        let data_offset = c.read_u32::<LittleEndian>()?;
        let data_length = c.read_u32::<LittleEndian>()?;
        let mut skip = [0u8; 16];
        c.read_exact(&mut skip)?;
        layers.push(LayerEntry {
            z_mm,
            exposure_s,
            light_off_s,
            data_offset,
            data_length,
        });
    }
    Ok(layers)
}

fn preview_bytes(data: &[u8], offset: u32) -> Option<&[u8]> {
    let off = offset as usize;
    if off == 0 || off + 16 > data.len() {
        return None;
    }
    let mut c = Cursor::new(&data[off..]);
    let _res_x = c.read_u32::<LittleEndian>().ok()?;
    let _res_y = c.read_u32::<LittleEndian>().ok()?;
    let img_offset = c.read_u32::<LittleEndian>().ok()? as usize;
    let img_len = c.read_u32::<LittleEndian>().ok()? as usize;
    if img_offset + img_len > data.len() {
        return None;
    }
    Some(&data[img_offset..img_offset + img_len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};

    /// Minimal CTB builder: a header, a layer table and raw payloads.
    fn synth_ctb(version: u32, key: u32, payloads: &[&[u8]]) -> Vec<u8> {
        let table_off = HEADER_LEN as u32;
        let mut data_off = table_off + payloads.len() as u32 * LAYER_ENTRY_LEN as u32;

        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(MAGIC_CTB).unwrap();
        out.write_u32::<LittleEndian>(version).unwrap();
        for _ in 0..3 {
            out.write_f32::<LittleEndian>(0.0).unwrap(); // bed dims
        }
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_f32::<LittleEndian>(payloads.len() as f32 * 0.05).unwrap();
        out.write_f32::<LittleEndian>(0.05).unwrap(); // layer height
        out.write_f32::<LittleEndian>(2.0).unwrap(); // exposure
        out.write_f32::<LittleEndian>(30.0).unwrap(); // bottom exposure
        out.write_f32::<LittleEndian>(0.5).unwrap(); // light-off
        out.write_u32::<LittleEndian>(4).unwrap(); // bottom layers
        out.write_u32::<LittleEndian>(64).unwrap(); // res x
        out.write_u32::<LittleEndian>(32).unwrap(); // res y
        out.write_u32::<LittleEndian>(0).unwrap(); // large preview
        out.write_u32::<LittleEndian>(table_off).unwrap();
        out.write_u32::<LittleEndian>(payloads.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap(); // small preview
        out.write_u32::<LittleEndian>(3600).unwrap(); // print time
        out.write_u32::<LittleEndian>(1).unwrap(); // projection
        out.write_u32::<LittleEndian>(0).unwrap(); // print params off
        out.write_u32::<LittleEndian>(0).unwrap(); // print params size
        out.write_u32::<LittleEndian>(1).unwrap(); // anti-alias
        out.write_u16::<LittleEndian>(255).unwrap();
        out.write_u16::<LittleEndian>(255).unwrap();
        out.write_u32::<LittleEndian>(key).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap(); // slicer info off
        out.write_u32::<LittleEndian>(0).unwrap(); // slicer info size
        assert_eq!(out.len() as u64, HEADER_LEN);

        for (i, p) in payloads.iter().enumerate() {
            out.write_f32::<LittleEndian>(0.05 * (i + 1) as f32).unwrap();
            out.write_f32::<LittleEndian>(2.0).unwrap();
            out.write_f32::<LittleEndian>(0.5).unwrap();
            out.write_u32::<LittleEndian>(data_off).unwrap();
            out.write_u32::<LittleEndian>(p.len() as u32).unwrap();
            out.extend_from_slice(&[0u8; 16]);
            data_off += p.len() as u32;
        }
        for p in payloads {
            out.extend_from_slice(p);
        }
        out
    }

    #[test]
    fn parses_header_and_index() {
        let file = synth_ctb(4, 0, &[b"abc", b"defgh"]);
        let sf = SliceFile::from_bytes(file).unwrap();
        assert_eq!(sf.resolution(), (64, 32));
        assert_eq!(sf.layer_count(), 2);
        assert_eq!(sf.bottom_layer_count(), 4);
        assert_eq!(sf.encryption_key(), 0);
        assert_eq!(sf.layer(0).unwrap().data, b"abc");
        assert_eq!(sf.layer(1).unwrap().data, b"defgh");
        assert!((sf.layer_meta(1).z_mm - 0.10).abs() < 1e-6);
    }

    #[test]
    fn key_is_ignored_below_v3() {
        let file = synth_ctb(2, 0xdead_beef, &[b"x"]);
        let sf = SliceFile::from_bytes(file).unwrap();
        assert_eq!(sf.encryption_key(), 0);

        let file = synth_ctb(4, 0xdead_beef, &[b"x"]);
        let sf = SliceFile::from_bytes(file).unwrap();
        assert_eq!(sf.encryption_key(), 0xdead_beef);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut file = synth_ctb(4, 0, &[b"x"]);
        file[0] = 0x00;
        assert!(matches!(
            SliceFile::from_bytes(file),
            Err(Error::InvalidFormat(_))
        ));

        let file = synth_ctb(9, 0, &[b"x"]);
        assert!(matches!(
            SliceFile::from_bytes(file),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_truncated_layer_table() {
        let mut file = synth_ctb(4, 0, &[b"abc"]);
        file.truncate(HEADER_LEN as usize + 10);
        assert!(matches!(
            SliceFile::from_bytes(file),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn layer_extent_checked_lazily() {
        let mut file = synth_ctb(4, 0, &[b"abc"]);
        // Corrupt the layer's data length so it points past EOF.
        let len_pos = HEADER_LEN as usize + 16;
        file[len_pos..len_pos + 4].copy_from_slice(&0xffff_u32.to_le_bytes());
        let sf = SliceFile::from_bytes(file).unwrap();
        let err = sf.layer(0).unwrap_err();
        assert!(err.to_string().contains("layer 0"));
    }

    #[test]
    fn empty_file_is_valid() {
        let file = synth_ctb(4, 0, &[]);
        let sf = SliceFile::from_bytes(file).unwrap();
        assert_eq!(sf.layer_count(), 0);
        assert_eq!(sf.iter_layers().count(), 0);
    }

    #[test]
    fn cbddlp_magic_is_accepted() {
        let mut file = synth_ctb(2, 0, &[b"x"]);
        file[0..4].copy_from_slice(&MAGIC_CBDDLP.to_le_bytes());
        let sf = SliceFile::from_bytes(file).unwrap();
        assert_eq!(sf.layer_count(), 1);
        assert_eq!(sf.encryption_key(), 0);

        // CBDDLP never went past version 2.
        let mut file = synth_ctb(4, 0, &[b"x"]);
        file[0..4].copy_from_slice(&MAGIC_CBDDLP.to_le_bytes());
        assert!(SliceFile::from_bytes(file).is_err());
    }

    #[test]
    fn preview_bytes_pass_through() {
        let mut file = synth_ctb(4, 0, &[b"x"]);
        let block = file.len() as u32;
        let image = b"not-actually-pixels";
        file.extend_from_slice(&400u32.to_le_bytes()); // preview res x
        file.extend_from_slice(&300u32.to_le_bytes()); // preview res y
        file.extend_from_slice(&(block + 16).to_le_bytes());
        file.extend_from_slice(&(image.len() as u32).to_le_bytes());
        file.extend_from_slice(image);
        file[60..64].copy_from_slice(&block.to_le_bytes());

        let sf = SliceFile::from_bytes(file).unwrap();
        assert_eq!(sf.large_preview(), Some(&image[..]));
        assert_eq!(sf.small_preview(), None);
    }

    #[test]
    fn print_params_feed_lift_height() {
        let mut file = synth_ctb(4, 0, &[b"x"]);
        let block = file.len() as u32;
        for value in [5.0f32, 60.0, 6.5, 90.0, 150.0, 12.3] {
            file.extend_from_slice(&value.to_le_bytes());
        }
        file[84..88].copy_from_slice(&block.to_le_bytes());
        file[88..92].copy_from_slice(&24u32.to_le_bytes());

        let sf = SliceFile::from_bytes(file).unwrap();
        assert!((sf.lift_height_mm() - 6.5).abs() < 1e-6);

        // An absent block degrades to zero, never an error.
        let sf = SliceFile::from_bytes(synth_ctb(4, 0, &[b"x"])).unwrap();
        assert_eq!(sf.lift_height_mm(), 0.0);
    }
}
