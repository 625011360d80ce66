//! Huffman encoding: byte streams and file bundles.
//!
//! The bundle layout, in order:
//!
//! 1. one byte of unique-symbol count (`0` stands for 256)
//! 2. per symbol: the byte, its code length, then the code bits
//! 3. a 16-bit entry count for the top level
//! 4. per entry: a tag bit (`1` = file, `0` = folder); files carry an 8-byte
//!    little-endian size, a length-prefixed coded name and their coded
//!    contents; folders carry a coded name, their own 16-bit entry count and
//!    recurse
//! 5. the final byte is padded with left-shifted zeros
//!
//! The byte-stream form used on stored values shares the preamble, followed
//! by an 8-byte little-endian payload length and the coded payload.

use std::{
    fs::{self, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::{info, warn};

use crate::storage::{ReadError, StorageError, WriteError};

use super::{BitWriter, CodeTable, build_codes};

/// Compresses a byte stream into a self-describing coded buffer.
pub fn compress_bytes(input: &[u8]) -> Result<Vec<u8>, StorageError> {
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let mut freq = [0u64; 256];
    for &byte in input {
        freq[byte as usize] += 1;
    }
    let table = build_codes(&freq);

    let mut writer = BitWriter::new(Vec::new());
    write_preamble(&mut writer, &table)?;
    writer.write_u64_le(input.len() as u64)?;
    for &byte in input {
        writer.write_code(code_for(&table, byte))?;
    }
    writer.finish()
}

/// Bundles files and directory trees into one Huffman-coded archive.
pub struct Compressor {
    inputs: Vec<PathBuf>,
    output: PathBuf,
}

impl Compressor {
    pub fn new<I, P>(inputs: I, output: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            output: output.into(),
        }
    }

    /// Runs both phases: frequency counting over every name and payload,
    /// then the coded rewrite into the bundle file.
    pub fn run(&self) -> Result<(), StorageError> {
        let mut freq = [0u64; 256];
        let mut original = 0u64;
        for path in &self.inputs {
            count_entry(path, &mut freq, &mut original)?;
        }
        let table = build_codes(&freq);
        info!(
            "compressor: {} inputs, {original} original bytes",
            self.inputs.len()
        );

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.output)
            .map_err(WriteError::Io)?;
        let mut writer = BitWriter::new(BufWriter::new(file));

        write_preamble(&mut writer, &table)?;
        writer.write_u16_le(self.inputs.len() as u16)?;
        for path in &self.inputs {
            write_entry(&mut writer, path, &table)?;
        }

        let mut sink = writer.finish()?;
        sink.flush().map_err(WriteError::Io)?;

        let compressed = fs::metadata(&self.output).map_err(ReadError::Io)?.len();
        info!("compressor: bundle written as {compressed} bytes");
        if compressed > original {
            warn!("compressor: bundle ended up larger than the originals");
        }
        Ok(())
    }
}

fn write_preamble<W: Write>(
    writer: &mut BitWriter<W>,
    table: &CodeTable,
) -> Result<(), StorageError> {
    let symbols = table.iter().filter(|code| code.is_some()).count();
    writer.write_octet(if symbols == 256 { 0 } else { symbols as u8 })?;
    for (symbol, code) in table.iter().enumerate() {
        if let Some(code) = code {
            writer.write_octet(symbol as u8)?;
            writer.write_octet(code.len() as u8)?;
            writer.write_code(code)?;
        }
    }
    Ok(())
}

fn code_for(table: &CodeTable, byte: u8) -> &[u8] {
    table[byte as usize]
        .as_deref()
        .expect("symbol was counted in phase one")
}

fn entry_name(path: &Path) -> Result<String, StorageError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| WriteError::Io(io::Error::other("unrepresentable entry name")))?;
    if name.len() > 255 {
        return Err(WriteError::NameTooLong.into());
    }
    Ok(name.to_string())
}

/// Children of a directory in a stable name order.
fn sorted_children(path: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut children = Vec::new();
    for entry in fs::read_dir(path).map_err(ReadError::Io)? {
        children.push(entry.map_err(ReadError::Io)?.path());
    }
    children.sort();
    Ok(children)
}

fn count_entry(path: &Path, freq: &mut [u64; 256], original: &mut u64) -> Result<(), StorageError> {
    let name = entry_name(path)?;
    for byte in name.bytes() {
        freq[byte as usize] += 1;
    }

    if path.is_dir() {
        for child in sorted_children(path)? {
            count_entry(&child, freq, original)?;
        }
    } else {
        let data = fs::read(path).map_err(ReadError::Io)?;
        for &byte in &data {
            freq[byte as usize] += 1;
        }
        *original += data.len() as u64;
    }
    Ok(())
}

fn write_entry<W: Write>(
    writer: &mut BitWriter<W>,
    path: &Path,
    table: &CodeTable,
) -> Result<(), StorageError> {
    let name = entry_name(path)?;

    if path.is_dir() {
        writer.write_bit(false)?;
        write_name(writer, &name, table)?;
        let children = sorted_children(path)?;
        writer.write_u16_le(children.len() as u16)?;
        for child in &children {
            write_entry(writer, child, table)?;
        }
    } else {
        writer.write_bit(true)?;
        let data = fs::read(path).map_err(ReadError::Io)?;
        writer.write_u64_le(data.len() as u64)?;
        write_name(writer, &name, table)?;
        for &byte in &data {
            writer.write_code(code_for(table, byte))?;
        }
    }
    Ok(())
}

fn write_name<W: Write>(
    writer: &mut BitWriter<W>,
    name: &str,
    table: &CodeTable,
) -> Result<(), StorageError> {
    writer.write_octet(name.len() as u8)?;
    for byte in name.bytes() {
        writer.write_code(code_for(table, byte))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::decompress_bytes;
    use super::*;

    #[test]
    fn byte_streams_round_trip() {
        let input = b"the quick brown fox jumps over the lazy dog".to_vec();
        let packed = compress_bytes(&input).unwrap();
        assert_eq!(decompress_bytes(&packed).unwrap(), input);
    }

    #[test]
    fn empty_streams_round_trip() {
        let packed = compress_bytes(&[]).unwrap();
        assert!(packed.is_empty());
        assert_eq!(decompress_bytes(&packed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn single_symbol_streams_round_trip() {
        let input = vec![b'a'; 1000];
        let packed = compress_bytes(&input).unwrap();
        // One symbol costs one bit, so a kilobyte of 'a' packs tightly.
        assert!(packed.len() < 150);
        assert_eq!(decompress_bytes(&packed).unwrap(), input);
    }

    #[test]
    fn all_symbols_round_trip() {
        // 256 unique symbols exercise the "0 means 256" header byte.
        let input: Vec<u8> = (0..=255).cycle().take(2048).collect();
        let packed = compress_bytes(&input).unwrap();
        assert_eq!(decompress_bytes(&packed).unwrap(), input);
    }

    #[test]
    fn skewed_streams_shrink() {
        let mut input = vec![b'a'; 10_000];
        input.extend_from_slice(b"rare");
        let packed = compress_bytes(&input).unwrap();
        assert!(packed.len() < input.len() / 4);
        assert_eq!(decompress_bytes(&packed).unwrap(), input);
    }
}
