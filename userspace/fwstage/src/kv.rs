// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Key-value persistence interface consumed by the upgrade state store
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Covered through state-store unit tests
//!
//! ADR: docs/adr/0031-firmware-staging-architecture.md

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

/// Maximum value size accepted by `put` (matches the backing store contract).
pub const MAX_VALUE_LEN: usize = 4096;

/// Key-value store error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvError {
    /// Key not present.
    NotFound,
    /// Backing store failure.
    Io,
    /// Value exceeds `MAX_VALUE_LEN`.
    ValueTooLarge,
}

/// Byte-blob persistence primitive. The backing implementation (journaled
/// store, EEPROM emulation, ...) is out of scope; only this surface is
/// consumed.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, KvError>;
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), KvError>;
}

/// In-memory store for testing, with an injectable write-failure switch.
#[derive(Debug, Default)]
pub struct MemKvStore {
    map: BTreeMap<String, Vec<u8>>,
    fail_puts: bool,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail with `KvError::Io`.
    pub fn set_fail_puts(&mut self, fail: bool) {
        self.fail_puts = fail;
    }

    /// Raw access for corruption fixtures.
    pub fn raw_insert(&mut self, key: &str, value: Vec<u8>) {
        self.map.insert(String::from(key), value);
    }
}

impl KeyValueStore for MemKvStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, KvError> {
        self.map.get(key).cloned().ok_or(KvError::NotFound)
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), KvError> {
        if self.fail_puts {
            return Err(KvError::Io);
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(KvError::ValueTooLarge);
        }
        self.map.insert(String::from(key), value.to_vec());
        Ok(())
    }
}
