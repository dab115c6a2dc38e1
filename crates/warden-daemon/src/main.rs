// Copyright (c) 2026 Joseph Verdicchio and Warden Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use warden_core::audit::policy::OsSampler;
use warden_core::audit::AuditPolicy;
use warden_core::clock::SystemClock;
use warden_core::keys::KeyRegistry;
use warden_core::store::SqliteStore;
use warden_daemon::config::DaemonConfig;
use warden_daemon::gc::{spawn_gc_jobs, GcSchedule};
use warden_daemon::http::{serve, AppState};
use warden_daemon::signer_setup::{build_signer, publish_keys};

#[derive(Debug, Parser)]
#[command(name = "warden-daemon")]
#[command(about = "Warden trust and governance daemon")]
struct Args {
    /// Overrides WARDEN_LISTEN.
    #[arg(long)]
    listen: Option<String>,

    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// SQLite database path; defaults to <data-dir>/warden.db.
    #[arg(long)]
    sqlite: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log: String,

    /// JSON audit policy (sampling rules, retention, extra critical types).
    #[arg(long)]
    audit_policy: Option<PathBuf>,

    /// JSON trusted key registry used for chain verification.
    #[arg(long)]
    trusted_keys: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .init();

    let mut cfg = DaemonConfig::from_env()?;
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    if let Err(err) = cfg.validate_startup() {
        eprintln!("refusing to start: {err}");
        return Err(err.into());
    }

    let addr: SocketAddr = cfg.listen.parse()?;

    std::fs::create_dir_all(&args.data_dir)?;
    let db_path = args
        .sqlite
        .unwrap_or_else(|| args.data_dir.join("warden.db"));
    let store = Arc::new(SqliteStore::open(&db_path)?);

    let policy = match args.audit_policy.as_ref() {
        Some(path) => AuditPolicy::load_from_json(path)?,
        None => AuditPolicy::default(),
    };
    let registry = Arc::new(match args.trusted_keys.as_ref() {
        Some(path) => KeyRegistry::load_from_json(path)?,
        None => KeyRegistry::new(),
    });

    let signer = build_signer(&cfg)?;
    publish_keys(signer.as_ref(), &registry).await;

    let state = AppState::assemble(
        store,
        signer,
        registry,
        policy,
        Arc::new(OsSampler),
        Arc::new(SystemClock),
        &cfg,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gc_jobs = spawn_gc_jobs(state.clone(), GcSchedule::from_config(&cfg), shutdown_rx);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, db = %db_path.display(), production_mode = cfg.production_mode, "starting Warden HTTP server");

    serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    for job in gc_jobs {
        let _ = job.await;
    }
    Ok(())
}
