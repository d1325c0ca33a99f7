//! Fixed-size block storage backing large serialized arrays.
//!
//! Data lives in power-of-two blocks of at least 4 KiB, so large arrays
//! never require one contiguous allocation. The serialized form is
//! `u64 block_size, u64 block_count`, then the raw block bytes, all
//! little-endian.

use crate::config;
use crate::error::{Error, Result};
use std::io::{Read, Write};

#[derive(Debug)]
pub struct MemoryBlockIo {
    block_size: u64,
    blocks: Vec<Vec<u8>>,
    /// High-water mark of bytes ever written.
    logical_size: u64,
}

impl MemoryBlockIo {
    /// Create an empty store. `block_size` must be a power of two no
    /// smaller than 4 KiB.
    pub fn new(block_size: u64) -> Result<Self> {
        if block_size < config::MIN_IO_BLOCK_BYTES || !block_size.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "block size {block_size} must be a power of two >= {}",
                config::MIN_IO_BLOCK_BYTES
            )));
        }
        Ok(Self {
            block_size,
            blocks: Vec::new(),
            logical_size: 0,
        })
    }

    #[inline]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Bytes covered by writes so far.
    #[inline]
    pub fn len(&self) -> u64 {
        self.logical_size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.logical_size == 0
    }

    fn ensure_blocks(&mut self, end: u64) -> Result<()> {
        let needed = end.div_ceil(self.block_size) as usize;
        while self.blocks.len() < needed {
            let mut block = Vec::new();
            block
                .try_reserve_exact(self.block_size as usize)
                .map_err(|e| Error::alloc("io block", e))?;
            block.resize(self.block_size as usize, 0);
            self.blocks.push(block);
        }
        Ok(())
    }

    /// Copy `bytes` in at `offset`, growing the store as needed. Writes may
    /// straddle block boundaries.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let end = offset + bytes.len() as u64;
        self.ensure_blocks(end)?;

        let mut cursor = offset;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let block_idx = (cursor / self.block_size) as usize;
            let in_block = (cursor % self.block_size) as usize;
            let room = self.block_size as usize - in_block;
            let take = room.min(remaining.len());
            self.blocks[block_idx][in_block..in_block + take].copy_from_slice(&remaining[..take]);
            cursor += take as u64;
            remaining = &remaining[take..];
        }
        self.logical_size = self.logical_size.max(end);
        Ok(())
    }

    /// Copy `out.len()` bytes starting at `offset` into `out`.
    pub fn read_at(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let end = offset + out.len() as u64;
        if end > self.blocks.len() as u64 * self.block_size {
            return Err(Error::InvalidArgument(format!(
                "read of {} bytes at offset {offset} past end of store",
                out.len()
            )));
        }
        let mut cursor = offset;
        let mut filled = 0usize;
        while filled < out.len() {
            let block_idx = (cursor / self.block_size) as usize;
            let in_block = (cursor % self.block_size) as usize;
            let room = self.block_size as usize - in_block;
            let take = room.min(out.len() - filled);
            out[filled..filled + take]
                .copy_from_slice(&self.blocks[block_idx][in_block..in_block + take]);
            cursor += take as u64;
            filled += take;
        }
        Ok(())
    }

    /// Write the block framing: `u64 block_size, u64 block_count`, then the
    /// raw blocks.
    pub fn dump<W: Write>(&self, out: &mut W) -> Result<()> {
        let io_err = |e: std::io::Error| Error::InternalError(format!("block sink: {e}"));
        out.write_all(&self.block_size.to_le_bytes()).map_err(io_err)?;
        out.write_all(&(self.blocks.len() as u64).to_le_bytes())
            .map_err(io_err)?;
        for block in &self.blocks {
            out.write_all(block).map_err(io_err)?;
        }
        Ok(())
    }

    /// Read the framing written by [`dump`](Self::dump).
    pub fn load<R: Read>(input: &mut R) -> Result<Self> {
        let mut header = [0u8; 16];
        input
            .read_exact(&mut header)
            .map_err(|e| Error::InvalidBinary(format!("block header: {e}")))?;
        let block_size = u64::from_le_bytes(header[0..8].try_into().expect("8 byte slice"));
        let block_count = u64::from_le_bytes(header[8..16].try_into().expect("8 byte slice"));

        if block_size < config::MIN_IO_BLOCK_BYTES || !block_size.is_power_of_two() {
            return Err(Error::InvalidBinary(format!(
                "block size {block_size} is not a power of two >= {}",
                config::MIN_IO_BLOCK_BYTES
            )));
        }
        let mut store = Self {
            block_size,
            blocks: Vec::new(),
            logical_size: block_count
                .checked_mul(block_size)
                .ok_or_else(|| Error::InvalidBinary("block count overflows".into()))?,
        };
        for _ in 0..block_count {
            let mut block = Vec::new();
            block
                .try_reserve_exact(block_size as usize)
                .map_err(|e| Error::alloc("io block", e))?;
            block.resize(block_size as usize, 0);
            input
                .read_exact(&mut block)
                .map_err(|e| Error::InvalidBinary(format!("truncated block: {e}")))?;
            store.blocks.push(block);
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_rejects_bad_block_size() {
        assert!(MemoryBlockIo::new(1000).is_err());
        assert!(MemoryBlockIo::new(6000).is_err());
        assert!(MemoryBlockIo::new(4096).is_ok());
        assert!(MemoryBlockIo::new(8192).is_ok());
    }

    #[test]
    fn test_write_read_straddling_blocks() {
        let mut io = MemoryBlockIo::new(4096).unwrap();
        let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        io.write_at(4090, &data).unwrap();
        assert_eq!(io.block_count(), 4);
        assert_eq!(io.len(), 4090 + 10_000);

        let mut out = vec![0u8; 10_000];
        io.read_at(4090, &mut out).unwrap();
        assert_eq!(out, data);

        // middle slice crossing a boundary
        let mut out = vec![0u8; 100];
        io.read_at(8150, &mut out).unwrap();
        assert_eq!(&out[..], &data[(8150 - 4090)..(8150 - 4090) + 100]);
    }

    #[test]
    fn test_read_past_end_errors() {
        let mut io = MemoryBlockIo::new(4096).unwrap();
        io.write_at(0, &[1, 2, 3]).unwrap();
        let mut out = vec![0u8; 8];
        assert!(io.read_at(4096 - 4, &mut out).is_err());
    }

    #[test]
    fn test_dump_load_roundtrip() {
        let mut io = MemoryBlockIo::new(4096).unwrap();
        let data: Vec<u8> = (0..9_999).map(|i| (i * 7 % 256) as u8).collect();
        io.write_at(123, &data).unwrap();

        let mut sink = Cursor::new(Vec::new());
        io.dump(&mut sink).unwrap();
        let bytes = sink.into_inner();
        // framing: 16 byte header + whole blocks
        assert_eq!(bytes.len(), 16 + io.block_count() * 4096);
        assert_eq!(u64::from_le_bytes(bytes[0..8].try_into().unwrap()), 4096);

        let loaded = MemoryBlockIo::load(&mut Cursor::new(&bytes)).unwrap();
        let mut out = vec![0u8; data.len()];
        loaded.read_at(123, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let mut bad = vec![0u8; 16];
        bad[0] = 1; // block_size = 1
        assert!(matches!(
            MemoryBlockIo::load(&mut Cursor::new(&bad)),
            Err(Error::InvalidBinary(_))
        ));
        // truncated block payload
        let mut io = MemoryBlockIo::new(4096).unwrap();
        io.write_at(0, &[9u8; 100]).unwrap();
        let mut sink = Cursor::new(Vec::new());
        io.dump(&mut sink).unwrap();
        let mut bytes = sink.into_inner();
        bytes.truncate(bytes.len() - 10);
        assert!(matches!(
            MemoryBlockIo::load(&mut Cursor::new(&bytes)),
            Err(Error::InvalidBinary(_))
        ));
    }
}
