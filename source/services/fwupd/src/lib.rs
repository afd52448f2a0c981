// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: fwupd agent – caller-facing firmware upgrade operations
//! OWNERS: @services-team
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Integration tests in tests/fwstage_host
//!   - stage/activate/recovery round trip through the agent
//!   - cancellation between chunk deliveries
//!   - worker-thread staging with completion signal
//!
//! PUBLIC API:
//!   - UpdateAgent: single-owner lock around the whole engine lifecycle
//!   - StagingWorker: background staging thread + completion signal
//!   - OpStatus / InstallCheck: closed result-code enumerations
//!
//! DEPENDS_ON: fwstage engine, flash device interface
//! ADR: docs/adr/0031-firmware-staging-architecture.md

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use flash::FlashDevice;
use fwstage::{
    Bootloader, EngineError, HashKind, KeyValueStore, RecoveryOutcome, UpdateEngine,
};

mod worker;
pub use worker::StagingWorker;

/// Closed result-code enumeration for agent operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Success,
    InProgress,
    RequiredReboot,
    Failure,
    Cancelled,
}

/// Answer to an installed-criteria query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallCheck {
    Installed,
    NotInstalled,
    Failure,
}

/// Errors surfaced to std callers.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Engine operation failed.
    #[error("engine operation failed: {0:?}")]
    Engine(EngineError),
    /// The engine lock was poisoned by a panicking holder.
    #[error("engine lock poisoned")]
    LockPoisoned,
    /// The staging worker stopped before the stream ended.
    #[error("staging worker disconnected")]
    WorkerGone,
}

/// Single-owner wrapper around the staging engine.
///
/// The whole Stage/Activate/recovery sequence runs behind one mutex (the
/// engine assumes one attempt at a time); the cancel flag is checked between
/// chunk deliveries, never inside a chunk's write, since a program operation
/// must not be interrupted mid-unit.
pub struct UpdateAgent<D: FlashDevice, K: KeyValueStore, B: Bootloader> {
    engine: Mutex<UpdateEngine<D, K, B>>,
    cancel: AtomicBool,
}

impl<D: FlashDevice, K: KeyValueStore, B: Bootloader> UpdateAgent<D, K, B> {
    pub fn new(engine: UpdateEngine<D, K, B>) -> Self {
        Self { engine: Mutex::new(engine), cancel: AtomicBool::new(false) }
    }

    /// Boot-time recovery; must run before anything else on every boot.
    pub fn on_boot(&self) -> Result<RecoveryOutcome, AgentError> {
        let mut engine = self.engine.lock().map_err(|_| AgentError::LockPoisoned)?;
        match engine.on_boot() {
            Ok(outcome) => {
                let detail = match outcome {
                    RecoveryOutcome::NoAttempt => "no-attempt",
                    RecoveryOutcome::Settled => "settled",
                    RecoveryOutcome::ResetRequired => "reset-required",
                };
                audit("recovery", "ok", Some(detail));
                Ok(outcome)
            }
            Err(err) => {
                audit("recovery", "fail", Some(error_detail(&err)));
                Err(AgentError::Engine(err))
            }
        }
    }

    /// Begin a staging attempt.
    pub fn stage(&self, expected_total: usize, expected_digest: &str, hash: HashKind) -> OpStatus {
        self.cancel.store(false, Ordering::SeqCst);
        let Ok(mut engine) = self.engine.lock() else {
            return OpStatus::Failure;
        };
        match engine.stage(expected_total, expected_digest, hash) {
            Ok(()) => {
                log::info!("fwupd: staging {expected_total} bytes");
                audit("stage", "ok", None);
                OpStatus::Success
            }
            Err(err) => {
                audit("stage", "fail", Some(error_detail(&err)));
                OpStatus::Failure
            }
        }
    }

    /// Deliver the next stream chunk. `InProgress` means the chunk was
    /// accepted and the stream continues.
    pub fn on_chunk(&self, bytes: &[u8]) -> OpStatus {
        if self.cancel.load(Ordering::SeqCst) {
            audit("chunk", "cancelled", None);
            return OpStatus::Cancelled;
        }
        let Ok(mut engine) = self.engine.lock() else {
            return OpStatus::Failure;
        };
        match engine.on_chunk(bytes) {
            Ok(()) => OpStatus::InProgress,
            Err(err) => {
                audit("chunk", "fail", Some(error_detail(&err)));
                OpStatus::Failure
            }
        }
    }

    /// End of stream: length check + integrity verification.
    pub fn finish(&self) -> OpStatus {
        if self.cancel.load(Ordering::SeqCst) {
            audit("finish", "cancelled", None);
            return OpStatus::Cancelled;
        }
        let Ok(mut engine) = self.engine.lock() else {
            return OpStatus::Failure;
        };
        match engine.finish() {
            Ok(()) => {
                audit("finish", "ok", None);
                OpStatus::Success
            }
            Err(err) => {
                audit("finish", "fail", Some(error_detail(&err)));
                OpStatus::Failure
            }
        }
    }

    /// Arm the verified staged image. Success means a reboot is required.
    pub fn activate(&self, criteria: &[u8]) -> OpStatus {
        let Ok(mut engine) = self.engine.lock() else {
            return OpStatus::Failure;
        };
        match engine.activate(criteria) {
            Ok(()) => {
                audit("activate", "ok", Some("reboot-required"));
                OpStatus::RequiredReboot
            }
            Err(err) => {
                audit("activate", "fail", Some(error_detail(&err)));
                OpStatus::Failure
            }
        }
    }

    /// Whether the update carrying `criteria` has been applied and confirmed.
    pub fn query_installed(&self, criteria: &[u8]) -> InstallCheck {
        let Ok(engine) = self.engine.lock() else {
            return InstallCheck::Failure;
        };
        match engine.query_installed(criteria) {
            Ok(true) => InstallCheck::Installed,
            Ok(false) => InstallCheck::NotInstalled,
            Err(err) => {
                audit("query", "fail", Some(error_detail(&err)));
                InstallCheck::Failure
            }
        }
    }

    /// Request cooperative cancellation: the transport is expected to stop
    /// feeding; bytes already written are not rolled back.
    pub fn cancel(&self) -> OpStatus {
        self.cancel.store(true, Ordering::SeqCst);
        audit("cancel", "ok", None);
        OpStatus::Success
    }

    /// Tear down the staging context and release the device.
    pub fn teardown(&self) -> OpStatus {
        let Ok(mut engine) = self.engine.lock() else {
            return OpStatus::Failure;
        };
        engine.teardown();
        OpStatus::Success
    }

    /// Hand the engine back (hosts simulating a reboot).
    pub fn into_engine(self) -> Result<UpdateEngine<D, K, B>, AgentError> {
        self.engine.into_inner().map_err(|_| AgentError::LockPoisoned)
    }
}

fn audit(op: &str, status: &str, detail: Option<&str>) {
    match detail {
        Some(detail) => log::info!("fwupd: audit op={op} status={status} detail={detail}"),
        None => log::info!("fwupd: audit op={op} status={status}"),
    }
}

fn error_detail(err: &EngineError) -> &'static str {
    match err {
        EngineError::BootRecoveryPending => "not-recovered",
        EngineError::NoActiveStage => "no-stage",
        EngineError::StageFinished => "stage-finished",
        EngineError::NotStaged => "not-staged",
        EngineError::EmptyCriteria => "empty-criteria",
        EngineError::LengthMismatch { .. } => "length",
        EngineError::Header(_) => "header",
        EngineError::Writer(_) => "writer",
        EngineError::Device(_) => "device",
        EngineError::Bootloader(_) => "bootloader",
        EngineError::State(_) => "state",
        EngineError::Verify(_) => "digest",
    }
}
