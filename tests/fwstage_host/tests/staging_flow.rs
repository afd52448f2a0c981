// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Integration tests for the staging flow (chunked write + verify)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 8 tests
//!
//! TEST_SCENARIOS:
//!   - test_stage_10000_bytes_in_300_byte_chunks(): happy-path staging
//!   - test_chunk_split_invariance_across_fixed_partitions(): identical commits
//!   - test_header_gate_rejects_bad_magic_first_chunk(): nothing written
//!   - test_header_gate_with_split_header(): offset never passes the header
//!   - test_stage_version_recorded_when_header_completes(): NV version capture
//!   - test_finish_rejects_length_mismatch(): short stream fails
//!   - test_finish_rejects_digest_mismatch_leaves_bytes(): diagnosis bytes kept
//!   - test_next_stage_erases_previous_attempt(): re-stage starts clean
//!
//! ADR: docs/adr/0031-firmware-staging-architecture.md

use flash::MemFlashDevice;
use fwstage::verify::encode_digest;
use fwstage::{
    EngineError, HashKind, HeaderError, ImageHeader, ImageVersion, MemKvStore, RamBootloader,
    UpdateEngine, HEADER_LEN, IMAGE_MAGIC,
};
use sha2::{Digest, Sha256};

type HostEngine = UpdateEngine<MemFlashDevice, MemKvStore, RamBootloader>;

const IMAGE_LEN: usize = 10_000;
const PROGRAM_UNIT: usize = 256;

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

fn host_engine() -> HostEngine {
    let device = MemFlashDevice::new(PROGRAM_UNIT, PROGRAM_UNIT, 16_384);
    let boot = RamBootloader::new(image_header(4096, version(1)));
    let mut engine = UpdateEngine::new(device, MemKvStore::new(), boot);
    engine.on_boot().expect("boot recovery ok");
    engine
}

fn stage_in_chunks(engine: &mut HostEngine, image: &[u8], chunk_len: usize) {
    engine.stage(image.len(), &sha256_b64(image), HashKind::Sha256).expect("stage ok");
    let mut offset = 0;
    for chunk in image.chunks(chunk_len) {
        engine.on_chunk(chunk).expect("chunk ok");
        offset += chunk.len();
        assert_eq!(engine.progress().expect("progress").offset, offset);
    }
    engine.finish().expect("finish ok");
}

#[test]
fn test_stage_10000_bytes_in_300_byte_chunks() {
    let image = build_image(IMAGE_LEN, version(2));
    let mut engine = host_engine();
    stage_in_chunks(&mut engine, &image, 300);

    assert!(engine.staged_ok());
    assert_eq!(&engine.device().raw_data()[..IMAGE_LEN], &image[..]);
    assert!(engine.device().raw_data()[IMAGE_LEN..].iter().all(|b| *b == 0xFF));
    assert_eq!(engine.stage_header(), Some(image_header(IMAGE_LEN, version(2))));
}

#[test]
fn test_chunk_split_invariance_across_fixed_partitions() {
    let image = build_image(IMAGE_LEN, version(2));
    let mut reference = host_engine();
    stage_in_chunks(&mut reference, &image, IMAGE_LEN);
    let expected = reference.device().raw_data().to_vec();

    for chunk_len in [53, 255, 256, 300, 4096] {
        let mut engine = host_engine();
        stage_in_chunks(&mut engine, &image, chunk_len);
        assert_eq!(engine.device().raw_data(), &expected[..], "chunk_len={chunk_len}");
    }
}

#[test]
fn test_header_gate_rejects_bad_magic_first_chunk() {
    let mut image = build_image(IMAGE_LEN, version(2));
    image[0] ^= 0xFF;
    let mut engine = host_engine();
    engine.stage(image.len(), &sha256_b64(&image), HashKind::Sha256).expect("stage ok");

    assert_eq!(
        engine.on_chunk(&image[..300]),
        Err(EngineError::Header(HeaderError::BadMagic))
    );
    // The rejected chunk was not written and the offset did not advance.
    assert_eq!(engine.progress().expect("progress").offset, 0);
    assert!(engine.device().raw_data().iter().all(|b| *b == 0xFF));
    // The attempt is dead until the next stage.
    assert_eq!(engine.on_chunk(&image[300..600]), Err(EngineError::StageFinished));
    assert_eq!(engine.activate(b"v2.0"), Err(EngineError::NotStaged));
}

#[test]
fn test_header_gate_with_split_header() {
    let mut image = build_image(IMAGE_LEN, version(2));
    image[2] ^= 0xFF;
    let mut engine = host_engine();
    engine.stage(image.len(), &sha256_b64(&image), HashKind::Sha256).expect("stage ok");

    // 8-byte chunks: the fourth one completes the header and must be the one
    // rejected, before the offset passes the header range.
    for chunk in image[..24].chunks(8) {
        engine.on_chunk(chunk).expect("pre-header chunk ok");
    }
    assert_eq!(
        engine.on_chunk(&image[24..32]),
        Err(EngineError::Header(HeaderError::BadMagic))
    );
    assert_eq!(engine.progress().expect("progress").offset, 24);
}

#[test]
fn test_stage_version_recorded_when_header_completes() {
    let image = build_image(IMAGE_LEN, version(3));
    let mut engine = host_engine();
    engine.stage(image.len(), &sha256_b64(&image), HashKind::Sha256).expect("stage ok");
    assert_eq!(engine.store().stage_version(), None);

    engine.on_chunk(&image[..300]).expect("chunk ok");
    // Version is in NV before any byte past the header is accepted.
    assert_eq!(engine.store().stage_version(), Some(version(3)));
}

#[test]
fn test_finish_rejects_length_mismatch() {
    let image = build_image(IMAGE_LEN, version(2));
    let mut engine = host_engine();
    engine.stage(IMAGE_LEN, &sha256_b64(&image), HashKind::Sha256).expect("stage ok");
    for chunk in image[..9_900].chunks(300) {
        engine.on_chunk(chunk).expect("chunk ok");
    }
    assert_eq!(
        engine.finish(),
        Err(EngineError::LengthMismatch { expected: IMAGE_LEN, actual: 9_900 })
    );
    assert!(!engine.staged_ok());
}

#[test]
fn test_finish_rejects_digest_mismatch_leaves_bytes() {
    let image = build_image(IMAGE_LEN, version(2));
    let other_digest = sha256_b64(b"some other payload");
    let mut engine = host_engine();
    engine.stage(image.len(), &other_digest, HashKind::Sha256).expect("stage ok");
    for chunk in image.chunks(300) {
        engine.on_chunk(chunk).expect("chunk ok");
    }
    match engine.finish() {
        Err(EngineError::Verify(_)) => {}
        other => panic!("expected digest mismatch, got {other:?}"),
    }
    // Staged bytes stay in place for diagnosis; only the next stage erases.
    assert_eq!(&engine.device().raw_data()[..IMAGE_LEN], &image[..]);
    assert_eq!(engine.activate(b"v2.0"), Err(EngineError::NotStaged));
}

#[test]
fn test_next_stage_erases_previous_attempt() {
    let image = build_image(IMAGE_LEN, version(2));
    let mut engine = host_engine();
    stage_in_chunks(&mut engine, &image, 300);
    assert!(engine.device().raw_data()[..IMAGE_LEN].iter().any(|b| *b != 0xFF));

    engine.stage(image.len(), &sha256_b64(&image), HashKind::Sha256).expect("re-stage ok");
    assert!(engine.device().raw_data().iter().all(|b| *b == 0xFF));
    // And the fresh context restarts the stream from zero.
    engine.on_chunk(&image[..300]).expect("chunk ok");
    assert_eq!(engine.progress().expect("progress").offset, 300);
}
