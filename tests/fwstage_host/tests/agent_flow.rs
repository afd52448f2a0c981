// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Integration tests for the fwupd agent and staging worker
//! OWNERS: @services-team
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 4 tests
//!
//! TEST_SCENARIOS:
//!   - test_agent_activate_without_stage_is_failure(): never RequiredReboot
//!   - test_agent_cancel_between_chunks(): cooperative cancellation
//!   - test_worker_stages_and_signals_completion(): background worker round trip
//!   - test_worker_reports_cancellation(): cancel observed by the worker
//!
//! ADR: docs/adr/0031-firmware-staging-architecture.md

use std::sync::Arc;

use flash::MemFlashDevice;
use fwstage::verify::encode_digest;
use fwstage::{
    HashKind, ImageHeader, ImageVersion, MemKvStore, RamBootloader, RecoveryOutcome, UpdateEngine,
    HEADER_LEN, IMAGE_MAGIC,
};
use fwupd::{InstallCheck, OpStatus, StagingWorker, UpdateAgent};
use sha2::{Digest, Sha256};

type HostAgent = UpdateAgent<MemFlashDevice, MemKvStore, RamBootloader>;

const IMAGE_LEN: usize = 10_000;

fn version(major: u8) -> ImageVersion {
    ImageVersion { major, minor: 0, revision: 0, build: 100 + major as u32 }
}

fn image_header(total_len: usize, ver: ImageVersion) -> ImageHeader {
    ImageHeader {
        magic: IMAGE_MAGIC,
        header_size: HEADER_LEN as u16,
        protect_trailer_size: 0,
        image_size: (total_len - HEADER_LEN) as u32,
        version: ver,
    }
}

fn build_image(total_len: usize, ver: ImageVersion) -> Vec<u8> {
    let mut image = image_header(total_len, ver).encode().to_vec();
    image.extend((HEADER_LEN..total_len).map(|i| (i * 17 % 251) as u8));
    image
}

fn sha256_b64(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    encode_digest(&hasher.finalize())
}

fn booted_agent() -> HostAgent {
    let device = MemFlashDevice::new(256, 256, 16_384);
    let boot = RamBootloader::new(image_header(4096, version(1)));
    let agent = UpdateAgent::new(UpdateEngine::new(device, MemKvStore::new(), boot));
    agent.on_boot().expect("boot recovery ok");
    agent
}

#[test]
fn test_agent_activate_without_stage_is_failure() {
    let agent = booted_agent();
    assert_eq!(agent.activate(b"v2.0"), OpStatus::Failure);

    // A stage that never passed verification is just as unactivatable.
    let image = build_image(IMAGE_LEN, version(2));
    assert_eq!(
        agent.stage(image.len(), &sha256_b64(&image), HashKind::Sha256),
        OpStatus::Success
    );
    assert_eq!(agent.on_chunk(&image[..300]), OpStatus::InProgress);
    assert_eq!(agent.activate(b"v2.0"), OpStatus::Failure);
}

#[test]
fn test_agent_cancel_between_chunks() {
    let agent = booted_agent();
    let image = build_image(IMAGE_LEN, version(2));
    assert_eq!(
        agent.stage(image.len(), &sha256_b64(&image), HashKind::Sha256),
        OpStatus::Success
    );
    assert_eq!(agent.on_chunk(&image[..300]), OpStatus::InProgress);
    assert_eq!(agent.cancel(), OpStatus::Success);
    // The flag is observed before the next chunk touches the device.
    assert_eq!(agent.on_chunk(&image[300..600]), OpStatus::Cancelled);
    assert_eq!(agent.finish(), OpStatus::Cancelled);
    // A fresh stage clears the cancellation.
    assert_eq!(
        agent.stage(image.len(), &sha256_b64(&image), HashKind::Sha256),
        OpStatus::Success
    );
    assert_eq!(agent.on_chunk(&image[..300]), OpStatus::InProgress);
}

#[test]
fn test_worker_stages_and_signals_completion() {
    let agent = Arc::new(booted_agent());
    let image = build_image(IMAGE_LEN, version(2));

    let worker = StagingWorker::spawn(
        Arc::clone(&agent),
        image.len(),
        sha256_b64(&image),
        HashKind::Sha256,
    );
    for chunk in image.chunks(300) {
        worker.feed(chunk.to_vec()).expect("feed ok");
    }
    assert_eq!(worker.finish(), OpStatus::Success);

    assert_eq!(agent.activate(b"v2.0"), OpStatus::RequiredReboot);
    assert_eq!(agent.query_installed(b"v2.0"), InstallCheck::NotInstalled);

    // Reboot: swap the staged image in and run recovery.
    let agent = match Arc::try_unwrap(agent) {
        Ok(agent) => agent,
        Err(_) => panic!("worker still holds the agent"),
    };
    let engine = agent.into_engine().expect("engine back");
    let (device, kv, mut boot) = engine.into_parts();
    boot.simulate_swap(image_header(IMAGE_LEN, version(2))).expect("swap ok");
    let agent = UpdateAgent::new(UpdateEngine::new(device, kv, boot));
    assert_eq!(agent.on_boot().expect("recovery ok"), RecoveryOutcome::Settled);
    assert_eq!(agent.query_installed(b"v2.0"), InstallCheck::Installed);
    assert_eq!(agent.query_installed(b"v1.9"), InstallCheck::NotInstalled);
}

#[test]
fn test_worker_reports_cancellation() {
    let agent = Arc::new(booted_agent());
    let image = build_image(IMAGE_LEN, version(2));

    let worker = StagingWorker::spawn(
        Arc::clone(&agent),
        image.len(),
        sha256_b64(&image),
        HashKind::Sha256,
    );
    worker.feed(image[..300].to_vec()).expect("feed ok");
    agent.cancel();
    // Fed after the cancel: the worker must observe the flag on this chunk at
    // the latest. Bytes already written are not rolled back.
    let _ = worker.feed(image[300..600].to_vec());
    assert_eq!(worker.finish(), OpStatus::Cancelled);
}
