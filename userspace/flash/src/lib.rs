// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Flash device abstractions for firmware staging backends
//! OWNERS: @runtime
//! STATUS: Functional (host-first)
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests (alignment + lifecycle), heavier coverage in downstream crates
//!
//! PUBLIC API:
//!   - FlashDevice: offset/length flash interface with program + read granularities
//!   - MemFlashDevice: in-memory flash device for tests
//!   - FlashError: error codes
//!
//! ADR: docs/adr/0031-firmware-staging-architecture.md

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

/// Flash device error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Read/program/erase failed.
    Io,
    /// Offset or length out of range or not aligned to the device granularity.
    OutOfRange,
    /// Operation attempted before `init` (or after `deinit`).
    NotReady,
}

/// Abstract flash region addressed by byte offset.
///
/// `program` and `erase` operate on multiples of the program size; `read`
/// operates on multiples of the read size. The read size is the larger
/// granularity on devices where they differ.
pub trait FlashDevice {
    /// Bring the device up. Idempotent.
    fn init(&mut self) -> Result<(), FlashError>;

    /// Release the device.
    fn deinit(&mut self) -> Result<(), FlashError>;

    /// Erase `len` bytes at `offset`. Both must be multiples of the program size.
    fn erase(&mut self, offset: usize, len: usize) -> Result<(), FlashError>;

    /// Program `len` bytes from `buf` at `offset`. Both must be multiples of
    /// the program size; `buf` must hold at least `len` bytes.
    fn program(&mut self, buf: &[u8], offset: usize, len: usize) -> Result<(), FlashError>;

    /// Read `len` bytes at `offset` into `buf`. Both must be multiples of the
    /// read size; `buf` must hold at least `len` bytes.
    fn read(&self, buf: &mut [u8], offset: usize, len: usize) -> Result<(), FlashError>;

    /// Minimum programmable unit in bytes.
    fn program_size(&self) -> usize;

    /// Minimum readable unit in bytes.
    fn read_size(&self) -> usize;

    /// Total region size in bytes.
    fn size(&self) -> usize;
}

/// In-memory flash device for testing.
///
/// Erased bytes read back as `0xFF`. Rejects unaligned or out-of-range
/// operations and any access before `init`. A program-failure switch lets
/// error-path tests make the Nth program operation fail.
pub struct MemFlashDevice {
    program_size: usize,
    read_size: usize,
    data: Vec<u8>,
    inited: bool,
    program_ops: usize,
    fail_program_at: Option<usize>,
}

impl MemFlashDevice {
    /// Create a device with the given granularities and total size.
    ///
    /// `read_size` must be a multiple of `program_size` and `size` a multiple
    /// of `read_size`, matching real parts where the read block is the larger
    /// unit.
    pub fn new(program_size: usize, read_size: usize, size: usize) -> Self {
        assert!(program_size > 0, "program size must be non-zero");
        assert!(
            read_size >= program_size && read_size % program_size == 0,
            "read size must be a multiple of program size"
        );
        assert!(size > 0 && size % read_size == 0, "size must be a multiple of read size");
        Self {
            program_size,
            read_size,
            data: vec![0xFF; size],
            inited: false,
            program_ops: 0,
            fail_program_at: None,
        }
    }

    /// Make the `n`th program operation (0-based) fail with `FlashError::Io`.
    pub fn fail_program_at(&mut self, n: usize) {
        self.fail_program_at = Some(n);
    }

    /// Number of program operations performed so far.
    pub fn program_ops(&self) -> usize {
        self.program_ops
    }

    /// Raw access to storage (for fixtures and corruption tests).
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw access to storage.
    pub fn raw_data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn check_span(&self, offset: usize, len: usize, unit: usize) -> Result<(), FlashError> {
        if unit == 0 || offset % unit != 0 || len % unit != 0 {
            return Err(FlashError::OutOfRange);
        }
        let end = offset.checked_add(len).ok_or(FlashError::OutOfRange)?;
        if end > self.data.len() {
            return Err(FlashError::OutOfRange);
        }
        Ok(())
    }
}

impl FlashDevice for MemFlashDevice {
    fn init(&mut self) -> Result<(), FlashError> {
        self.inited = true;
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), FlashError> {
        self.inited = false;
        Ok(())
    }

    fn erase(&mut self, offset: usize, len: usize) -> Result<(), FlashError> {
        if !self.inited {
            return Err(FlashError::NotReady);
        }
        self.check_span(offset, len, self.program_size)?;
        self.data[offset..offset + len].fill(0xFF);
        Ok(())
    }

    fn program(&mut self, buf: &[u8], offset: usize, len: usize) -> Result<(), FlashError> {
        if !self.inited {
            return Err(FlashError::NotReady);
        }
        self.check_span(offset, len, self.program_size)?;
        if buf.len() < len {
            return Err(FlashError::OutOfRange);
        }
        if self.fail_program_at == Some(self.program_ops) {
            self.program_ops += 1;
            return Err(FlashError::Io);
        }
        self.program_ops += 1;
        self.data[offset..offset + len].copy_from_slice(&buf[..len]);
        Ok(())
    }

    fn read(&self, buf: &mut [u8], offset: usize, len: usize) -> Result<(), FlashError> {
        if !self.inited {
            return Err(FlashError::NotReady);
        }
        self.check_span(offset, len, self.read_size)?;
        if buf.len() < len {
            return Err(FlashError::OutOfRange);
        }
        buf[..len].copy_from_slice(&self.data[offset..offset + len]);
        Ok(())
    }

    fn program_size(&self) -> usize {
        self.program_size
    }

    fn read_size(&self) -> usize {
        self.read_size
    }

    fn size(&self) -> usize {
        self.data.len()
    }
}
