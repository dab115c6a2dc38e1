// Copyright (c) 2026 Joseph Verdicchio and Warden Contributors
// SPDX-License-Identifier: Apache-2.0

//! warden-core
//!
//! Trust and governance primitives shared by every service that performs a
//! privileged action:
//! - Canonicalizer: one deterministic byte encoding for anything hashed or signed
//! - Signer: local Ed25519 / dev HMAC, remote KMS endpoint, fail-closed guard
//! - AuditLedger: sampled, signed, hash-chained audit events with retention GC
//! - IdempotencyStore: exactly-once execution of client-retried requests
//! - MultisigGate: N-of-M approval state machine in front of "apply"

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod audit;
pub mod canonical;
pub mod clock;
pub mod error;
pub mod idempotency;
pub mod keys;
pub mod locks;
pub mod multisig;
pub mod principal;
pub mod signer;
pub mod store;

pub use crate::error::{WardenError, WardenResult};
pub use crate::principal::Principal;
