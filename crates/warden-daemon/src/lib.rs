// Copyright (c) 2026 Joseph Verdicchio and Warden Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod gc;
pub mod http;
pub mod public_error;
pub mod signer_setup;
pub mod telemetry;
