// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Staged-image integrity verification against the manifest digest
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests (digest match, mismatch, short final block)
//!
//! ADR: docs/adr/0031-firmware-staging-architecture.md

use alloc::string::String;
use alloc::vec;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flash::{FlashDevice, FlashError};
use sha2::{Digest, Sha256};

/// Digest algorithms the update manifest may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Sha256,
}

/// Verification errors. On a mismatch the staged bytes are left in place for
/// diagnosis; the next Stage erases them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    Device(FlashError),
    DigestMismatch { expected: String, actual: String },
}

/// Compute the SHA-256 digest of `[0, image_len)` by re-reading the staged
/// image in read-block-sized reads.
///
/// The final short remainder is read as a full block (clamped to the device
/// end, still read-size-aligned); only the logically valid prefix is hashed.
/// The buffer, not the device, bounds what is taken.
pub fn digest_image<D: FlashDevice>(
    device: &D,
    read_block_len: usize,
    image_len: usize,
) -> Result<[u8; 32], VerifyError> {
    let mut hasher = Sha256::new();
    let mut block = vec![0u8; read_block_len];
    let mut offset = 0usize;
    let mut remaining = image_len;

    while remaining >= read_block_len {
        device.read(&mut block, offset, read_block_len).map_err(VerifyError::Device)?;
        hasher.update(&block);
        offset += read_block_len;
        remaining -= read_block_len;
    }
    if remaining > 0 {
        let read_len = read_block_len.min(device.size() - offset);
        device.read(&mut block, offset, read_len).map_err(VerifyError::Device)?;
        hasher.update(&block[..remaining]);
    }

    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Encode a digest the way the manifest carries it.
pub fn encode_digest(digest: &[u8]) -> String {
    BASE64.encode(digest)
}

/// Re-read the staged image and compare its encoded digest against the
/// expected manifest value.
pub fn verify_image<D: FlashDevice>(
    device: &D,
    read_block_len: usize,
    image_len: usize,
    kind: HashKind,
    expected: &str,
) -> Result<(), VerifyError> {
    let digest = match kind {
        HashKind::Sha256 => digest_image(device, read_block_len, image_len)?,
    };
    let actual = encode_digest(&digest);
    if actual != expected {
        return Err(VerifyError::DigestMismatch { expected: String::from(expected), actual });
    }
    Ok(())
}
