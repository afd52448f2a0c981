// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Program-unit-aligned streaming writer for the secondary slot
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests + proptest chunk-split invariance (tests/writer_props.rs)
//!   - unaligned head / aligned middle / unaligned tail splits
//!   - neighbor bytes within a shared program unit preserved
//!   - contiguity enforcement, device failure abort
//!
//! ADR: docs/adr/0031-firmware-staging-architecture.md

use alloc::vec;
use alloc::vec::Vec;

use flash::{FlashDevice, FlashError};

/// Read scratch size floor; grown to the device's read size when that is
/// larger, and always kept a multiple of it.
pub const READ_BLOCK_DEFAULT: usize = 1024;

/// Streaming writer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterError {
    /// Device granularities unusable: zero program size, read size smaller
    /// than the program size, or not a multiple of it.
    Config,
    /// Chunk offset does not continue the stream (no gaps, no rewind).
    NonContiguous { expected: usize, actual: usize },
    /// Underlying device failure. Units already programmed stay programmed.
    Device(FlashError),
}

/// Turns a stream of variably-sized, sequentially-offset chunks into aligned
/// program operations, with read-modify-write only for the unaligned head and
/// tail of each chunk.
///
/// Every byte of every call is committed before `write` returns; nothing is
/// buffered across calls, so a stream that stops mid-unit has still programmed
/// everything delivered so far.
pub struct StreamWriter {
    program_unit: Vec<u8>,
    read_block: Vec<u8>,
    next_offset: usize,
}

impl StreamWriter {
    pub fn new<D: FlashDevice>(device: &D) -> Result<Self, WriterError> {
        let program_size = device.program_size();
        let read_size = device.read_size();
        if program_size == 0 || read_size < program_size || read_size % program_size != 0 {
            return Err(WriterError::Config);
        }
        let read_block_len = if read_size >= READ_BLOCK_DEFAULT {
            read_size
        } else {
            READ_BLOCK_DEFAULT.div_ceil(read_size) * read_size
        };
        Ok(Self {
            program_unit: vec![0u8; program_size],
            read_block: vec![0u8; read_block_len],
            next_offset: 0,
        })
    }

    /// Next offset the stream must continue at.
    pub fn next_offset(&self) -> usize {
        self.next_offset
    }

    /// Size of the read scratch buffer (also used by verification).
    pub fn read_block_len(&self) -> usize {
        self.read_block.len()
    }

    /// Program `bytes` at the cumulative stream position `offset`.
    pub fn write<D: FlashDevice>(
        &mut self,
        device: &mut D,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), WriterError> {
        if offset != self.next_offset {
            return Err(WriterError::NonContiguous { expected: self.next_offset, actual: offset });
        }
        let end = offset.checked_add(bytes.len()).ok_or(WriterError::Device(FlashError::OutOfRange))?;
        if end > device.size() {
            return Err(WriterError::Device(FlashError::OutOfRange));
        }

        let unit = self.program_unit.len();
        let mut data = bytes;
        let mut pos = offset;

        // Unaligned head: splice into the containing unit and program it whole.
        let head = (pos.div_ceil(unit) * unit - pos).min(data.len());
        if head > 0 {
            let unit_start = pos - pos % unit;
            self.load_program_unit(device, unit_start)?;
            let within = pos - unit_start;
            self.program_unit[within..within + head].copy_from_slice(&data[..head]);
            device.program(&self.program_unit, unit_start, unit).map_err(WriterError::Device)?;
            data = &data[head..];
            pos += head;
        }

        // Fully aligned middle: programmed directly, no read-modify-write.
        let mid = (data.len() / unit) * unit;
        if mid > 0 {
            device.program(&data[..mid], pos, mid).map_err(WriterError::Device)?;
            data = &data[mid..];
            pos += mid;
        }

        // Unaligned tail: same splice as the head. The next chunk's head will
        // re-read this unit and fill in the rest.
        if !data.is_empty() {
            self.load_program_unit(device, pos)?;
            self.program_unit[..data.len()].copy_from_slice(data);
            device.program(&self.program_unit, pos, unit).map_err(WriterError::Device)?;
        }

        self.next_offset = end;
        Ok(())
    }

    /// Read the program unit starting at `unit_start` through a
    /// read-block-aligned read, extracting the unit from the larger block.
    fn load_program_unit<D: FlashDevice>(
        &mut self,
        device: &D,
        unit_start: usize,
    ) -> Result<(), WriterError> {
        let unit = self.program_unit.len();
        let block = self.read_block.len();
        let block_start = (unit_start / block) * block;
        // The trailing block of a device whose size is not a multiple of the
        // scratch size is read short, still read-size-aligned.
        let read_len = block.min(device.size() - block_start);
        device.read(&mut self.read_block, block_start, read_len).map_err(WriterError::Device)?;
        let within = unit_start - block_start;
        self.program_unit.copy_from_slice(&self.read_block[within..within + unit]);
        Ok(())
    }
}
