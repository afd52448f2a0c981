// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Staging orchestrator (Stage/Activate lifecycle + boot-time recovery)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests (gating) + full lifecycle in tests/fwstage_host
//!
//! PUBLIC API:
//!   - UpdateEngine: owns the secondary device, the upgrade state store and
//!     the bootloader handle; at most one staging context at a time
//!   - on_boot(): recovery entry point, must run before any other operation
//!
//! ADR: docs/adr/0031-firmware-staging-architecture.md

use alloc::string::String;

use flash::{FlashDevice, FlashError};

use crate::bootloader::{BootError, Bootloader};
use crate::header::{HeaderAssembler, HeaderError, ImageHeader, IMAGE_MAGIC};
use crate::kv::KeyValueStore;
use crate::state::{StateError, UpgradeStateStore};
use crate::verify::{self, HashKind, VerifyError};
use crate::writer::{StreamWriter, WriterError};

/// Orchestrator errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// `on_boot` has not run yet; no other operation is reachable before it.
    BootRecoveryPending,
    /// No staging context exists (Stage was never called or was torn down).
    NoActiveStage,
    /// The staging context already finished (verified or failed).
    StageFinished,
    /// Activate without a verified staged image.
    NotStaged,
    /// Empty installed-criteria marker.
    EmptyCriteria,
    /// Stream ended with a total different from the announced one.
    LengthMismatch { expected: usize, actual: usize },
    Header(HeaderError),
    Writer(WriterError),
    Device(FlashError),
    Bootloader(BootError),
    State(StateError),
    Verify(VerifyError),
}

impl From<HeaderError> for EngineError {
    fn from(err: HeaderError) -> Self {
        Self::Header(err)
    }
}

impl From<WriterError> for EngineError {
    fn from(err: WriterError) -> Self {
        Self::Writer(err)
    }
}

impl From<FlashError> for EngineError {
    fn from(err: FlashError) -> Self {
        Self::Device(err)
    }
}

impl From<BootError> for EngineError {
    fn from(err: BootError) -> Self {
        Self::Bootloader(err)
    }
}

impl From<StateError> for EngineError {
    fn from(err: StateError) -> Self {
        Self::State(err)
    }
}

impl From<VerifyError> for EngineError {
    fn from(err: VerifyError) -> Self {
        Self::Verify(err)
    }
}

/// What the boot-time recovery concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No upgrade attempt was in flight.
    NoAttempt,
    /// The swapped image is confirmed; the installed criteria was settled.
    Settled,
    /// The running image could not be confirmed; the caller must reset the
    /// device so the bootloader's own revert logic can swap the previous
    /// image back.
    ResetRequired,
}

/// Download progress for the attempt in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes accepted so far; strictly monotonic across chunk callbacks.
    pub offset: usize,
    pub expected_total: usize,
    /// Set at end of stream.
    pub actual_total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Receiving,
    StagedOk,
    Failed,
}

/// Per-attempt working context. Created by `stage`, torn down before the next
/// `stage` (or explicitly); at most one exists at a time.
struct StagingContext {
    active_header: ImageHeader,
    assembler: HeaderAssembler,
    stage_header: Option<ImageHeader>,
    writer: StreamWriter,
    read_block_len: usize,
    hash: HashKind,
    expected_digest: String,
    progress: Progress,
    phase: Phase,
}

/// The firmware staging engine.
///
/// Owns the secondary slot device, the non-volatile upgrade state and the
/// bootloader handle. Callers in a concurrent environment must serialize the
/// whole Stage/Activate/recovery sequence behind a single owner.
pub struct UpdateEngine<D: FlashDevice, K: KeyValueStore, B: Bootloader> {
    device: D,
    store: UpgradeStateStore<K>,
    boot: B,
    ctx: Option<StagingContext>,
    device_inited: bool,
    boot_recovered: bool,
}

impl<D: FlashDevice, K: KeyValueStore, B: Bootloader> UpdateEngine<D, K, B> {
    pub fn new(device: D, kv: K, boot: B) -> Self {
        Self {
            device,
            store: UpgradeStateStore::new(kv),
            boot,
            ctx: None,
            device_inited: false,
            boot_recovered: false,
        }
    }

    /// Boot-time recovery. Must be called once per boot before any other
    /// operation; safe to call again (every step re-reads the persisted
    /// record rather than trusting in-memory state).
    pub fn on_boot(&mut self) -> Result<RecoveryOutcome, EngineError> {
        // First boot after an activate-requested reboot.
        if let Some(false) = self.store.install_rebooted() {
            self.store.set_install_rebooted(true)?;
        }

        // No self-test flow exists: trust the image that actually booted and
        // ask the bootloader to keep it rather than letting it revert.
        if self.store.installed(&self.boot) == Some(false) {
            let _ = self.boot.mark_confirmed();
        }

        let outcome = match self.store.installed(&self.boot) {
            Some(true) => {
                // Settle can only fail when a previous pass already promoted
                // the criteria; the reset below applies either way.
                let _ = self.store.settle_installed_criteria();
                self.store.reset(false)?;
                RecoveryOutcome::Settled
            }
            Some(false) => {
                self.store.reset(false)?;
                RecoveryOutcome::ResetRequired
            }
            None => RecoveryOutcome::NoAttempt,
        };
        self.boot_recovered = true;
        Ok(outcome)
    }

    /// Begin a staging attempt: tear down any previous context, clear the
    /// attempt-scoped persistent state, capture the active image header and
    /// erase the secondary slot in full.
    pub fn stage(
        &mut self,
        expected_total: usize,
        expected_digest: &str,
        hash: HashKind,
    ) -> Result<(), EngineError> {
        self.ensure_recovered()?;
        self.teardown();
        self.store.reset(false)?;

        let active = self.boot.active_header()?;
        if active.magic != IMAGE_MAGIC {
            return Err(EngineError::Header(HeaderError::BadMagic));
        }

        self.device.init()?;
        self.device_inited = true;
        let writer = StreamWriter::new(&self.device)?;
        let read_block_len = writer.read_block_len();
        let size = self.device.size();
        self.device.erase(0, size)?;

        self.ctx = Some(StagingContext {
            active_header: active,
            assembler: HeaderAssembler::new(),
            stage_header: None,
            writer,
            read_block_len,
            hash,
            expected_digest: String::from(expected_digest),
            progress: Progress { offset: 0, expected_total, actual_total: 0 },
            phase: Phase::Receiving,
        });
        Ok(())
    }

    /// Accept the next stream chunk. The image header is assembled and gated
    /// first: a chunk completing an invalid header fails the attempt before
    /// any of it is written, and the stage version is persisted the moment
    /// the header completes, before any post-header byte is accepted.
    pub fn on_chunk(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        if !self.boot_recovered {
            return Err(EngineError::BootRecoveryPending);
        }
        let ctx = self.ctx.as_mut().ok_or(EngineError::NoActiveStage)?;
        if ctx.phase != Phase::Receiving {
            return Err(EngineError::StageFinished);
        }

        if !ctx.assembler.complete() {
            match ctx.assembler.feed(bytes) {
                Ok(Some(header)) => {
                    if let Err(err) = self.store.set_stage_version(&header.version) {
                        ctx.phase = Phase::Failed;
                        return Err(EngineError::State(err));
                    }
                    ctx.stage_header = Some(header);
                }
                Ok(None) => {}
                Err(err) => {
                    ctx.phase = Phase::Failed;
                    return Err(EngineError::Header(err));
                }
            }
        }

        if let Err(err) = ctx.writer.write(&mut self.device, ctx.progress.offset, bytes) {
            ctx.phase = Phase::Failed;
            return Err(EngineError::Writer(err));
        }
        ctx.progress.offset += bytes.len();
        Ok(())
    }

    /// End of stream: check the announced total, then re-read and verify the
    /// staged image. On failure the staged bytes stay in place for diagnosis
    /// (the next `stage` erases them).
    pub fn finish(&mut self) -> Result<(), EngineError> {
        if !self.boot_recovered {
            return Err(EngineError::BootRecoveryPending);
        }
        let ctx = self.ctx.as_mut().ok_or(EngineError::NoActiveStage)?;
        if ctx.phase != Phase::Receiving {
            return Err(EngineError::StageFinished);
        }

        ctx.progress.actual_total = ctx.progress.offset;
        if ctx.stage_header.is_none() {
            ctx.phase = Phase::Failed;
            return Err(EngineError::Header(HeaderError::Truncated));
        }
        if ctx.progress.actual_total != ctx.progress.expected_total {
            ctx.phase = Phase::Failed;
            return Err(EngineError::LengthMismatch {
                expected: ctx.progress.expected_total,
                actual: ctx.progress.actual_total,
            });
        }
        if let Err(err) = verify::verify_image(
            &self.device,
            ctx.read_block_len,
            ctx.progress.actual_total,
            ctx.hash,
            &ctx.expected_digest,
        ) {
            ctx.phase = Phase::Failed;
            return Err(EngineError::Verify(err));
        }
        ctx.phase = Phase::StagedOk;
        Ok(())
    }

    /// Arm the staged image: persist the caller's completion marker, mark the
    /// secondary slot pending non-permanent (so an unconfirmed swap can be
    /// reverted) and clear the rebooted flag. Success means a reboot is
    /// required to proceed.
    pub fn activate(&mut self, criteria: &[u8]) -> Result<(), EngineError> {
        self.ensure_recovered()?;
        if criteria.is_empty() {
            return Err(EngineError::EmptyCriteria);
        }
        let staged_ok = self.ctx.as_ref().map(|ctx| ctx.phase) == Some(Phase::StagedOk);
        if !staged_ok {
            return Err(EngineError::NotStaged);
        }
        self.store.set_stage_criteria(criteria)?;
        self.boot.mark_pending(false)?;
        self.store.set_install_rebooted(false)?;
        Ok(())
    }

    /// Whether the update carrying `criteria` has completed: staged,
    /// activated, rebooted and confirmed. Only a settled persistent marker
    /// counts.
    pub fn query_installed(&self, criteria: &[u8]) -> Result<bool, EngineError> {
        self.ensure_recovered()?;
        if criteria.is_empty() {
            return Err(EngineError::EmptyCriteria);
        }
        match self.store.persistent_criteria() {
            Some(persistent) => Ok(persistent.as_slice() == criteria),
            None => Ok(false),
        }
    }

    /// Destroy the staging context and release the device. Already-written
    /// bytes are not rolled back.
    pub fn teardown(&mut self) {
        self.ctx = None;
        if self.device_inited {
            let _ = self.device.deinit();
            self.device_inited = false;
        }
    }

    pub fn progress(&self) -> Option<Progress> {
        self.ctx.as_ref().map(|ctx| ctx.progress)
    }

    /// Header of the running image, captured at Stage start.
    pub fn active_header(&self) -> Option<ImageHeader> {
        self.ctx.as_ref().map(|ctx| ctx.active_header)
    }

    /// Header assembled from the stream, once complete.
    pub fn stage_header(&self) -> Option<ImageHeader> {
        self.ctx.as_ref().and_then(|ctx| ctx.stage_header)
    }

    pub fn staged_ok(&self) -> bool {
        self.ctx.as_ref().map(|ctx| ctx.phase) == Some(Phase::StagedOk)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn store(&self) -> &UpgradeStateStore<K> {
        &self.store
    }

    /// Dismantle the engine, handing back the device, key-value store and
    /// bootloader (used by hosts simulating a reboot).
    pub fn into_parts(mut self) -> (D, K, B) {
        self.teardown();
        (self.device, self.store.into_inner(), self.boot)
    }

    fn ensure_recovered(&self) -> Result<(), EngineError> {
        if !self.boot_recovered {
            return Err(EngineError::BootRecoveryPending);
        }
        Ok(())
    }
}
