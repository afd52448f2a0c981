// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Background staging worker (dedicated thread + completion signal)
//! OWNERS: @services-team
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Integration tests in tests/fwstage_host
//!
//! ADR: docs/adr/0031-firmware-staging-architecture.md

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flash::FlashDevice;
use fwstage::{Bootloader, HashKind, KeyValueStore};

use crate::{AgentError, OpStatus, UpdateAgent};

enum WorkerMsg {
    Chunk(Vec<u8>),
    Finish,
}

/// Dedicated staging thread.
///
/// The control thread feeds chunks through a channel and collects a single
/// completion status; chunk writes run synchronously on the worker. The only
/// other cross-thread interaction is the agent's cancel flag, observed
/// between chunk deliveries.
pub struct StagingWorker {
    tx: Sender<WorkerMsg>,
    done_rx: Receiver<OpStatus>,
    handle: Option<JoinHandle<()>>,
}

impl StagingWorker {
    /// Spawn the worker: it begins the staging attempt itself (erasing the
    /// secondary slot), then consumes chunks until `finish` or the first
    /// failure.
    pub fn spawn<D, K, B>(
        agent: Arc<UpdateAgent<D, K, B>>,
        expected_total: usize,
        expected_digest: String,
        hash: HashKind,
    ) -> Self
    where
        D: FlashDevice + Send + 'static,
        K: KeyValueStore + Send + 'static,
        B: Bootloader + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let status = run(&agent, &rx, expected_total, &expected_digest, hash);
            let _ = done_tx.send(status);
        });
        Self { tx, done_rx, handle: Some(handle) }
    }

    /// Queue the next chunk. Fails once the worker has stopped (the final
    /// status is waiting in `finish`).
    pub fn feed(&self, chunk: Vec<u8>) -> Result<(), AgentError> {
        self.tx.send(WorkerMsg::Chunk(chunk)).map_err(|_| AgentError::WorkerGone)
    }

    /// Signal end of stream and wait for the completion status.
    pub fn finish(mut self) -> OpStatus {
        let _ = self.tx.send(WorkerMsg::Finish);
        let status = self.done_rx.recv().unwrap_or(OpStatus::Failure);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        status
    }
}

fn run<D, K, B>(
    agent: &UpdateAgent<D, K, B>,
    rx: &Receiver<WorkerMsg>,
    expected_total: usize,
    expected_digest: &str,
    hash: HashKind,
) -> OpStatus
where
    D: FlashDevice,
    K: KeyValueStore,
    B: Bootloader,
{
    let status = agent.stage(expected_total, expected_digest, hash);
    if status != OpStatus::Success {
        return status;
    }
    loop {
        match rx.recv() {
            Ok(WorkerMsg::Chunk(chunk)) => match agent.on_chunk(&chunk) {
                OpStatus::InProgress => {}
                other => return other,
            },
            Ok(WorkerMsg::Finish) => return agent.finish(),
            // Feeder dropped without an end-of-stream signal.
            Err(_) => return OpStatus::Cancelled,
        }
    }
}
