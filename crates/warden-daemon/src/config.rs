use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use warden_core::multisig::DEFAULT_BREAKGLASS_ROLE;

pub const PRODUCTION_MODE_ENV: &str = "WARDEN_PRODUCTION_MODE";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {detail}")]
    Invalid { var: &'static str, detail: String },

    #[error("{0}")]
    StartupGuard(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerMode {
    Local,
    Remote,
}

#[derive(Clone)]
pub struct DaemonConfig {
    pub listen: String,
    pub max_body_bytes: usize,
    pub production_mode: bool,

    pub signer_mode: SignerMode,
    pub signer_id: Option<String>,
    pub signing_key_hex: Option<String>,
    pub signing_key_file: Option<PathBuf>,
    pub hmac_dev_secret: Option<String>,
    pub fail_closed: bool,

    pub remote_endpoint: Option<String>,
    pub remote_key_id: Option<String>,
    pub remote_bearer_token: Option<String>,
    pub remote_timeout_ms: u64,
    pub remote_attempts: u32,
    pub remote_backoff_ms: u64,

    pub idempotency_ttl_secs: u64,
    pub audit_gc_interval_secs: u64,
    pub idempotency_gc_interval_secs: u64,
    pub gc_batch_size: usize,
    pub breakglass_min_approvals: u32,
    pub breakglass_role: String,
}

impl std::fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("listen", &self.listen)
            .field("production_mode", &self.production_mode)
            .field("signer_mode", &self.signer_mode)
            .field("signer_id", &self.signer_id)
            .field("fail_closed", &self.fail_closed)
            .field("remote_endpoint", &self.remote_endpoint)
            .field("remote_attempts", &self.remote_attempts)
            .finish_non_exhaustive()
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8787".to_string(),
            max_body_bytes: 65_536,
            production_mode: false,
            signer_mode: SignerMode::Local,
            signer_id: None,
            signing_key_hex: None,
            signing_key_file: None,
            hmac_dev_secret: None,
            fail_closed: true,
            remote_endpoint: None,
            remote_key_id: None,
            remote_bearer_token: None,
            remote_timeout_ms: 2_000,
            remote_attempts: 3,
            remote_backoff_ms: 100,
            idempotency_ttl_secs: 86_400,
            audit_gc_interval_secs: 300,
            idempotency_gc_interval_secs: 60,
            gc_batch_size: 500,
            breakglass_min_approvals: 1,
            breakglass_role: DEFAULT_BREAKGLASS_ROLE.to_string(),
        }
    }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        v if v.eq_ignore_ascii_case("true") => Ok(true),
        v if v.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(ConfigError::Invalid {
            var,
            detail: format!("expected a boolean, got {other:?}"),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        detail: format!("expected a number, got {raw:?}"),
    })
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `WARDEN_*` variables supplied by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("WARDEN_LISTEN") {
            cfg.listen = v;
        }
        if let Some(v) = get("WARDEN_MAX_BODY_BYTES") {
            cfg.max_body_bytes = parse_num("WARDEN_MAX_BODY_BYTES", &v)?;
        }
        if let Some(v) = get(PRODUCTION_MODE_ENV) {
            cfg.production_mode = parse_bool(PRODUCTION_MODE_ENV, &v)?;
        }
        if let Some(v) = get("WARDEN_SIGNER") {
            cfg.signer_mode = match v.trim() {
                m if m.eq_ignore_ascii_case("local") => SignerMode::Local,
                m if m.eq_ignore_ascii_case("remote") => SignerMode::Remote,
                other => {
                    return Err(ConfigError::Invalid {
                        var: "WARDEN_SIGNER",
                        detail: format!("expected local or remote, got {other:?}"),
                    })
                }
            };
        }
        cfg.signer_id = get("WARDEN_SIGNER_ID");
        cfg.signing_key_hex = get("WARDEN_SIGNING_KEY_HEX");
        cfg.signing_key_file = get("WARDEN_SIGNING_KEY_FILE").map(PathBuf::from);
        cfg.hmac_dev_secret = get("WARDEN_HMAC_DEV_SECRET");
        if let Some(v) = get("WARDEN_SIGNER_FAIL_CLOSED") {
            cfg.fail_closed = parse_bool("WARDEN_SIGNER_FAIL_CLOSED", &v)?;
        }
        cfg.remote_endpoint = get("WARDEN_REMOTE_SIGNER_URL");
        cfg.remote_key_id = get("WARDEN_REMOTE_SIGNER_KEY_ID");
        cfg.remote_bearer_token = get("WARDEN_REMOTE_SIGNER_TOKEN");
        if let Some(v) = get("WARDEN_REMOTE_SIGNER_TIMEOUT_MS") {
            cfg.remote_timeout_ms = parse_num("WARDEN_REMOTE_SIGNER_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("WARDEN_REMOTE_SIGNER_ATTEMPTS") {
            cfg.remote_attempts = parse_num("WARDEN_REMOTE_SIGNER_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("WARDEN_REMOTE_SIGNER_BACKOFF_MS") {
            cfg.remote_backoff_ms = parse_num("WARDEN_REMOTE_SIGNER_BACKOFF_MS", &v)?;
        }
        if let Some(v) = get("WARDEN_IDEMPOTENCY_TTL_SECS") {
            cfg.idempotency_ttl_secs = parse_num("WARDEN_IDEMPOTENCY_TTL_SECS", &v)?;
        }
        if let Some(v) = get("WARDEN_AUDIT_GC_INTERVAL_SECS") {
            cfg.audit_gc_interval_secs = parse_num("WARDEN_AUDIT_GC_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("WARDEN_IDEMPOTENCY_GC_INTERVAL_SECS") {
            cfg.idempotency_gc_interval_secs =
                parse_num("WARDEN_IDEMPOTENCY_GC_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("WARDEN_GC_BATCH_SIZE") {
            cfg.gc_batch_size = parse_num("WARDEN_GC_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("WARDEN_BREAKGLASS_MIN_APPROVALS") {
            cfg.breakglass_min_approvals = parse_num("WARDEN_BREAKGLASS_MIN_APPROVALS", &v)?;
        }
        if let Some(v) = get("WARDEN_BREAKGLASS_ROLE") {
            let role = v.trim();
            if role.is_empty() {
                return Err(ConfigError::Invalid {
                    var: "WARDEN_BREAKGLASS_ROLE",
                    detail: "must not be empty".to_string(),
                });
            }
            cfg.breakglass_role = role.to_string();
        }

        if cfg.remote_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "WARDEN_REMOTE_SIGNER_ATTEMPTS",
                detail: "must be at least 1".to_string(),
            });
        }
        if cfg.signer_mode == SignerMode::Remote && cfg.remote_endpoint.is_none() {
            return Err(ConfigError::Invalid {
                var: "WARDEN_REMOTE_SIGNER_URL",
                detail: "required when WARDEN_SIGNER=remote".to_string(),
            });
        }
        Ok(cfg)
    }

    fn has_local_key(&self) -> bool {
        self.signing_key_hex.is_some() || self.signing_key_file.is_some()
    }

    /// Refuses configurations that weaken signing guarantees in production.
    pub fn validate_startup(&self) -> Result<(), ConfigError> {
        if !self.production_mode {
            return Ok(());
        }
        if !self.fail_closed {
            return Err(ConfigError::StartupGuard(
                "production mode forbids WARDEN_SIGNER_FAIL_CLOSED=0".to_string(),
            ));
        }
        if self.hmac_dev_secret.is_some() {
            return Err(ConfigError::StartupGuard(
                "production mode forbids the HMAC dev signer".to_string(),
            ));
        }
        if self.signer_mode == SignerMode::Local && !self.has_local_key() {
            return Err(ConfigError::StartupGuard(
                "production mode forbids an ephemeral signing key; set WARDEN_SIGNING_KEY_FILE"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn remote_backoff(&self) -> Duration {
        Duration::from_millis(self.remote_backoff_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }
}
