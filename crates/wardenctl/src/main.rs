// Copyright (c) 2026 Joseph Verdicchio and Warden Contributors
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use serde::Deserialize;
use serde_json::{json, Value};
use warden_core::audit::{verify_chain, AuditEvent};
use warden_core::canonical::{canonicalize, sha256_hex, CANONICAL_VERSION};
use warden_core::keys::KeyRegistry;
use warden_core::signer::local::default_ed25519_signer_id;

#[derive(Parser)]
#[command(name = "wardenctl", about = "Offline tooling for Warden audit chains")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify an exported audit chain against a trusted key registry.
    VerifyChain {
        #[arg(long)]
        events: PathBuf,
        #[arg(long)]
        keys: PathBuf,
    },
    /// Print the canonical form of a JSON document and its sha256.
    Canonicalize {
        #[arg(long = "in")]
        input: PathBuf,
    },
    /// Check a canonical test-vector file.
    Vectors {
        #[arg(long)]
        file: PathBuf,
    },
    /// Write a new Ed25519 seed (hex) to a file.
    Keygen {
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Deserialize)]
struct Vector {
    name: String,
    value: Value,
    canonical: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::VerifyChain { events, keys } => run_verify_chain(&events, &keys),
        Commands::Canonicalize { input } => run_canonicalize(&input),
        Commands::Vectors { file } => run_vectors(&file),
        Commands::Keygen { out, force } => run_keygen(&out, force),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read {what}: {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to decode {what}: {}", path.display()))
}

fn run_verify_chain(events_path: &Path, keys_path: &Path) -> Result<()> {
    let events: Vec<AuditEvent> = read_json(events_path, "events file")?;
    let registry = KeyRegistry::load_from_json(keys_path)
        .with_context(|| format!("failed to load key registry: {}", keys_path.display()))?;
    let report = verify_chain(&events, &registry).context("chain verification failed")?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn run_canonicalize(input: &Path) -> Result<()> {
    let value: Value = read_json(input, "input")?;
    let bytes = canonicalize(&value);
    let text = String::from_utf8(bytes.clone()).context("canonical output is not UTF-8")?;
    println!("{text}");
    println!("sha256:{}", sha256_hex(&bytes));
    Ok(())
}

fn run_vectors(file: &Path) -> Result<()> {
    let vectors: Vec<Vector> = read_json(file, "vector file")?;
    let mut failed = Vec::new();
    for vector in &vectors {
        let actual = canonicalize(&vector.value);
        if actual != vector.canonical.as_bytes() {
            eprintln!(
                "mismatch {}: expected {} got {}",
                vector.name,
                vector.canonical,
                String::from_utf8_lossy(&actual)
            );
            failed.push(vector.name.clone());
        }
    }
    println!(
        "{}",
        json!({
            "version": CANONICAL_VERSION,
            "checked": vectors.len(),
            "failed": failed,
        })
    );
    if !failed.is_empty() {
        bail!("{} of {} vectors failed", failed.len(), vectors.len());
    }
    Ok(())
}

fn run_keygen(out: &Path, force: bool) -> Result<()> {
    if out.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", out.display());
    }
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    let public = key.verifying_key();
    fs::write(out, hex::encode(key.to_bytes()))
        .with_context(|| format!("failed to write key: {}", out.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(out, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict key permissions: {}", out.display()))?;
    }
    let signer_id = default_ed25519_signer_id(public.as_bytes());
    println!(
        "{}",
        json!({
            "signerId": signer_id,
            "publicKeyHex": hex::encode(public.as_bytes()),
            "seedFile": out.display().to_string(),
        })
    );
    Ok(())
}
