//! Store-only ZIP packaging.
//!
//! Layer PNGs are already deflated, so entries are written with method 0
//! (store) and zeroed DOS timestamps: the archive bytes are a pure function
//! of the entry names and contents, which is what makes whole-archive
//! determinism testable. The writer tracks its own offset instead of
//! seeking, so it runs over any `Write` sink.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use crc::crc32;

use crate::error::{Error, Result};

const LOCAL_SIG: u32 = 0x0403_4b50;
const CD_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;
const VERSION: u16 = 20;
const METHOD_STORE: u16 = 0;

/// Hard limits of the classic (non-64) ZIP format this writer targets.
const MAX_ENTRIES: usize = 65_535;
const MAX_NAME: usize = 65_535;
const MAX_ENTRY_SIZE: u64 = u32::MAX as u64;

struct CdEntry {
    name: Vec<u8>,
    crc: u32,
    size: u32,
    local_offset: u32,
}

/// Writer for a store-only ZIP archive.
///
/// `add` appends a local header plus raw bytes; `finalize` writes the
/// central directory and end record. Dropping the writer without
/// finalizing (or calling [`ZipWriter::abort`]) leaves the sink without a
/// central directory, which no consumer will accept as an archive.
pub struct ZipWriter<W: Write> {
    sink: W,
    offset: u64,
    entries: Vec<CdEntry>,
}

impl ZipWriter<BufWriter<File>> {
    /// Create an archive file on disk.
    pub fn create(path: &Path) -> Result<ZipWriter<BufWriter<File>>> {
        Ok(ZipWriter::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> ZipWriter<W> {
    /// Wrap an arbitrary sink.
    pub fn new(sink: W) -> ZipWriter<W> {
        ZipWriter {
            sink,
            offset: 0,
            entries: Vec::new(),
        }
    }

    /// Number of entries added so far.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.offset
    }

    /// Append one stored entry.
    pub fn add(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        if self.entries.len() >= MAX_ENTRIES {
            return Err(Error::ArchiveLimit(format!(
                "archive cannot hold more than {} entries",
                MAX_ENTRIES
            )));
        }
        let name_bytes = name.as_bytes();
        if name_bytes.len() > MAX_NAME {
            return Err(Error::ArchiveLimit(format!(
                "entry name of {} bytes",
                name_bytes.len()
            )));
        }
        if bytes.len() as u64 > MAX_ENTRY_SIZE {
            return Err(Error::ArchiveLimit(format!(
                "entry '{}' is {} bytes",
                name,
                bytes.len()
            )));
        }
        if self.offset > u64::from(u32::MAX) {
            return Err(Error::ArchiveLimit(
                "archive exceeds 4 GiB without zip64".into(),
            ));
        }

        let crc = crc32::checksum_ieee(bytes);
        let local_offset = self.offset as u32;

        let w = &mut self.sink;
        w.write_u32::<LittleEndian>(LOCAL_SIG)?;
        w.write_u16::<LittleEndian>(VERSION)?;
        w.write_u16::<LittleEndian>(0)?; // flags
        w.write_u16::<LittleEndian>(METHOD_STORE)?;
        w.write_u16::<LittleEndian>(0)?; // mod time
        w.write_u16::<LittleEndian>(0)?; // mod date
        w.write_u32::<LittleEndian>(crc)?;
        w.write_u32::<LittleEndian>(bytes.len() as u32)?; // compressed
        w.write_u32::<LittleEndian>(bytes.len() as u32)?; // uncompressed
        w.write_u16::<LittleEndian>(name_bytes.len() as u16)?;
        w.write_u16::<LittleEndian>(0)?; // extra field
        w.write_all(name_bytes)?;
        w.write_all(bytes)?;

        self.offset += 30 + name_bytes.len() as u64 + bytes.len() as u64;
        self.entries.push(CdEntry {
            name: name_bytes.to_vec(),
            crc,
            size: bytes.len() as u32,
            local_offset,
        });
        Ok(())
    }

    /// Write the central directory and end record, then hand back the sink.
    pub fn finalize(mut self) -> Result<W> {
        let cd_offset = self.offset;
        if cd_offset > u64::from(u32::MAX) {
            return Err(Error::ArchiveLimit(
                "central directory offset exceeds 4 GiB".into(),
            ));
        }

        let mut cd_size: u64 = 0;
        for e in &self.entries {
            let w = &mut self.sink;
            w.write_u32::<LittleEndian>(CD_SIG)?;
            w.write_u16::<LittleEndian>(VERSION)?; // made by
            w.write_u16::<LittleEndian>(VERSION)?; // needed
            w.write_u16::<LittleEndian>(0)?; // flags
            w.write_u16::<LittleEndian>(METHOD_STORE)?;
            w.write_u16::<LittleEndian>(0)?; // mod time
            w.write_u16::<LittleEndian>(0)?; // mod date
            w.write_u32::<LittleEndian>(e.crc)?;
            w.write_u32::<LittleEndian>(e.size)?;
            w.write_u32::<LittleEndian>(e.size)?;
            w.write_u16::<LittleEndian>(e.name.len() as u16)?;
            w.write_u16::<LittleEndian>(0)?; // extra
            w.write_u16::<LittleEndian>(0)?; // comment
            w.write_u16::<LittleEndian>(0)?; // disk
            w.write_u16::<LittleEndian>(0)?; // internal attrs
            w.write_u32::<LittleEndian>(0)?; // external attrs
            w.write_u32::<LittleEndian>(e.local_offset)?;
            w.write_all(&e.name)?;
            cd_size += 46 + e.name.len() as u64;
        }

        let w = &mut self.sink;
        w.write_u32::<LittleEndian>(EOCD_SIG)?;
        w.write_u16::<LittleEndian>(0)?; // disk
        w.write_u16::<LittleEndian>(0)?; // cd disk
        w.write_u16::<LittleEndian>(self.entries.len() as u16)?;
        w.write_u16::<LittleEndian>(self.entries.len() as u16)?;
        w.write_u32::<LittleEndian>(cd_size as u32)?;
        w.write_u32::<LittleEndian>(cd_offset as u32)?;
        w.write_u16::<LittleEndian>(0)?; // comment
        self.sink.flush()?;
        Ok(self.sink)
    }

    /// Close the sink without writing a central directory. The caller is
    /// expected to remove the file.
    pub fn abort(mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }
}

/// Name of a layer's PNG entry: zero-padded decimal, at least five digits,
/// widened when the layer count needs more.
pub fn layer_entry_name(index: u32, layer_count: u32) -> String {
    let mut digits = 1usize;
    let mut n = layer_count.saturating_sub(1) / 10;
    while n > 0 {
        digits += 1;
        n /= 10;
    }
    let width = digits.max(5);
    format!("{:0width$}.png", index, width = width)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_u16(d: &[u8], o: usize) -> u16 {
        u16::from_le_bytes([d[o], d[o + 1]])
    }

    fn le_u32(d: &[u8], o: usize) -> u32 {
        u32::from_le_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]])
    }

    /// Locate the EOCD and return (entry_count, cd_offset).
    fn parse_eocd(zip: &[u8]) -> Option<(u16, u32)> {
        if zip.len() < 22 {
            return None;
        }
        let mut i = zip.len() - 22;
        loop {
            if le_u32(zip, i) == EOCD_SIG {
                return Some((le_u16(zip, i + 10), le_u32(zip, i + 16)));
            }
            if i == 0 {
                return None;
            }
            i -= 1;
        }
    }

    fn cd_names(zip: &[u8]) -> Vec<String> {
        let (count, cd_off) = parse_eocd(zip).unwrap();
        let mut names = Vec::new();
        let mut pos = cd_off as usize;
        for _ in 0..count {
            assert_eq!(le_u32(zip, pos), CD_SIG);
            let name_len = le_u16(zip, pos + 28) as usize;
            names.push(
                String::from_utf8(zip[pos + 46..pos + 46 + name_len].to_vec()).unwrap(),
            );
            pos += 46 + name_len;
        }
        names
    }

    #[test]
    fn writes_store_entries_with_mirrored_directory() {
        let mut w = ZipWriter::new(Vec::new());
        w.add("slice.json", b"{}").unwrap();
        w.add("00000.png", b"fakepng").unwrap();
        let zip = w.finalize().unwrap();

        // Local header of the first entry.
        assert_eq!(le_u32(&zip, 0), LOCAL_SIG);
        assert_eq!(le_u16(&zip, 4), VERSION);
        assert_eq!(le_u16(&zip, 6), 0); // flags
        assert_eq!(le_u16(&zip, 8), METHOD_STORE);
        assert_eq!(le_u32(&zip, 14), crc32::checksum_ieee(b"{}"));
        assert_eq!(le_u32(&zip, 18), 2); // compressed
        assert_eq!(le_u32(&zip, 22), 2); // uncompressed
        assert_eq!(&zip[30..40], b"slice.json");

        assert_eq!(cd_names(&zip), vec!["slice.json", "00000.png"]);

        // CD record mirrors the local header and records its offset.
        let (_, cd_off) = parse_eocd(&zip).unwrap();
        let pos = cd_off as usize;
        assert_eq!(le_u32(&zip, pos + 16), crc32::checksum_ieee(b"{}"));
        assert_eq!(le_u32(&zip, pos + 42), 0); // first local header offset
    }

    #[test]
    fn empty_archive_is_just_an_end_record() {
        let zip = ZipWriter::new(Vec::new()).finalize().unwrap();
        assert_eq!(zip.len(), 22);
        assert_eq!(parse_eocd(&zip), Some((0, 0)));
    }

    #[test]
    fn abort_leaves_no_directory() {
        let mut w = ZipWriter::new(Vec::new());
        w.add("00000.png", b"data").unwrap();
        w.abort().unwrap();
        // An aborted archive has no EOCD to find (nothing was finalized),
        // so the sink contents cannot be opened as a ZIP.
    }

    #[test]
    fn oversized_names_are_refused() {
        let mut w = ZipWriter::new(Vec::new());
        let long = "x".repeat(MAX_NAME + 1);
        assert!(matches!(
            w.add(&long, b""),
            Err(Error::ArchiveLimit(_))
        ));
    }

    #[test]
    fn layer_names_are_zero_padded_ascending() {
        assert_eq!(layer_entry_name(0, 10), "00000.png");
        assert_eq!(layer_entry_name(9, 10), "00009.png");
        assert_eq!(layer_entry_name(123, 5000), "00123.png");
        assert_eq!(layer_entry_name(0, 200_000), "000000.png");
        assert_eq!(layer_entry_name(99_999, 100_000), "99999.png");

        let mut names: Vec<String> = (0..200).map(|i| layer_entry_name(i, 200)).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        names.dedup();
        assert_eq!(names.len(), 200);
    }
}
