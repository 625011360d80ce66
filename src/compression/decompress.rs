//! Huffman decoding: the mirror of [`compress`](super::compress).
//!
//! The decoder rebuilds the prefix trie from the preamble, then walks the
//! per-entry records, creating files and directories as it goes. A selective
//! decode takes a target name and skips non-matching branches by consuming
//! the exact number of bits they occupy: skipped contents are still decoded
//! symbol by symbol, just never materialised.

use std::{
    fs::{self, File},
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use log::{debug, info};

use crate::storage::{ReadError, StorageError};

use super::{BitReader, DecodeTrie};

/// Decompresses a buffer produced by
/// [`compress_bytes`](super::compress_bytes).
pub fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>, StorageError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = BitReader::new(data);
    let trie = read_preamble(&mut reader)?;
    let len = reader.read_u64_le()?;

    let mut out = Vec::with_capacity(len as usize);
    for _ in 0..len {
        out.push(trie.decode_symbol(&mut reader)?);
    }
    Ok(out)
}

/// Unpacks bundles produced by [`Compressor`](super::Compressor).
pub struct Decompressor {
    bundle: PathBuf,
}

impl Decompressor {
    pub fn new(bundle: impl Into<PathBuf>) -> Self {
        Self {
            bundle: bundle.into(),
        }
    }

    /// Materialises every entry of the bundle under `dest`.
    pub fn unpack(&self, dest: impl AsRef<Path>) -> Result<(), StorageError> {
        self.run(dest.as_ref(), None)
    }

    /// Materialises only the entry named `target` (looked up at any depth)
    /// under `dest`; everything else is decoded and discarded.
    pub fn unpack_only(&self, dest: impl AsRef<Path>, target: &str) -> Result<(), StorageError> {
        self.run(dest.as_ref(), Some(target))
    }

    fn run(&self, dest: &Path, target: Option<&str>) -> Result<(), StorageError> {
        let file = File::open(&self.bundle).map_err(ReadError::Io)?;
        let mut reader = BitReader::new(BufReader::new(file));
        let trie = read_preamble(&mut reader)?;

        fs::create_dir_all(dest).map_err(ReadError::Io)?;
        let count = reader.read_u16_le()?;
        info!(
            "decompressor: {count} top-level entries{}",
            target.map(|t| format!(", target {t:?}")).unwrap_or_default()
        );
        for _ in 0..count {
            read_entry(&mut reader, &trie, dest, target)?;
        }
        Ok(())
    }
}

fn read_preamble<R: Read>(reader: &mut BitReader<R>) -> Result<DecodeTrie, StorageError> {
    let count = reader.read_octet()?;
    let count = if count == 0 { 256 } else { count as usize };

    let mut trie = DecodeTrie::new();
    for _ in 0..count {
        let symbol = reader.read_octet()?;
        let len = reader.read_octet()? as usize;
        let mut code = Vec::with_capacity(len);
        for _ in 0..len {
            code.push(reader.read_bit()? as u8);
        }
        trie.insert(&code, symbol);
    }
    Ok(trie)
}

fn read_name<R: Read>(
    reader: &mut BitReader<R>,
    trie: &DecodeTrie,
) -> Result<String, StorageError> {
    let len = reader.read_octet()? as usize;
    let mut bytes = Vec::with_capacity(len);
    for _ in 0..len {
        bytes.push(trie.decode_symbol(reader)?);
    }
    String::from_utf8(bytes).map_err(|_| ReadError::Malformed.into())
}

fn read_entry<R: Read>(
    reader: &mut BitReader<R>,
    trie: &DecodeTrie,
    dest: &Path,
    target: Option<&str>,
) -> Result<(), StorageError> {
    let is_file = reader.read_bit()?;

    if is_file {
        let size = reader.read_u64_le()?;
        let name = read_name(reader, trie)?;
        if target.is_none_or(|t| t == name) {
            let mut data = Vec::with_capacity(size as usize);
            for _ in 0..size {
                data.push(trie.decode_symbol(reader)?);
            }
            fs::write(dest.join(&name), data).map_err(ReadError::Io)?;
            debug!("decompressor: wrote file {name:?} ({size} bytes)");
        } else {
            for _ in 0..size {
                trie.decode_symbol(reader)?;
            }
            debug!("decompressor: skipped file {name:?}");
        }
    } else {
        let name = read_name(reader, trie)?;
        let count = reader.read_u16_le()?;
        if target.is_none_or(|t| t == name) {
            let subdir = dest.join(&name);
            fs::create_dir_all(&subdir).map_err(ReadError::Io)?;
            for _ in 0..count {
                read_entry(reader, trie, &subdir, None)?;
            }
        } else {
            debug!("decompressor: searching {name:?} for the target");
            for _ in 0..count {
                read_entry(reader, trie, dest, target)?;
            }
        }
    }
    Ok(())
}
