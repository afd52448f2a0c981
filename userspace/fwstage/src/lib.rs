// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Firmware staging engine (chunked staging + reset-safe upgrade state)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests per module + tests/fwstage_host integration suite
//!   - aligned stream writer (chunk-split invariance, error paths)
//!   - upgrade record encode/decode, reserved-region preservation
//!   - boot-time recovery (confirm, settle, revert request, idempotence)
//!   - staged-image digest verification
//!
//! PUBLIC API:
//!   - UpdateEngine: Stage/Activate/QueryInstalled orchestrator + on_boot recovery
//!   - StreamWriter: program-unit-aligned streaming writer
//!   - UpgradeStateStore: non-volatile upgrade state record
//!   - ImageHeader / HeaderAssembler: image header extraction
//!   - Bootloader / KeyValueStore: consumed interfaces (with RAM test doubles)
//!
//! DEPENDENCIES:
//!   - flash: secondary slot device interface
//!   - sha2: staged image digest
//!   - base64: manifest digest encoding
//!
//! ADR: docs/adr/0031-firmware-staging-architecture.md

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

extern crate alloc;

pub mod bootloader;
pub mod engine;
pub mod header;
pub mod kv;
pub mod state;
pub mod verify;
pub mod writer;

pub use bootloader::{BootError, Bootloader, RamBootloader};
pub use engine::{EngineError, Progress, RecoveryOutcome, UpdateEngine};
pub use header::{HeaderAssembler, HeaderError, ImageHeader, ImageVersion, HEADER_LEN, IMAGE_MAGIC};
pub use kv::{KeyValueStore, KvError, MemKvStore};
pub use state::{StateError, UpgradeRecord, UpgradeStateStore, CRITERIA_MAX, RECORD_LEN};
pub use verify::{HashKind, VerifyError};
pub use writer::{StreamWriter, WriterError};
