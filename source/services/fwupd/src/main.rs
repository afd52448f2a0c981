// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: fwupd daemon entrypoint; transport and dispatch are wired by the platform

fn main() {
    eprintln!("fwupd: host daemon placeholder (transport not wired); see fwupd::UpdateAgent");
}
