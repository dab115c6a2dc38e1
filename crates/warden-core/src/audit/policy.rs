//! Which audit events are kept, and for how long.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{WardenError, WardenResult};
use crate::principal::Principal;

/// Always kept at rate 1.0 and never removed by retention GC.
pub const DEFAULT_CRITICAL_EVENT_TYPES: &[&str] = &[
    "multisig.requested",
    "multisig.approval",
    "multisig.rejection",
    "multisig.applied",
    "multisig.breakglass_applied",
    "audit.event_purged",
    "key.rotated",
    "package.published",
    "model.promoted",
    "payout.approved",
    "upgrade.applied",
];

const MS_PER_DAY: u64 = 86_400_000;

/// Source of uniform draws in `[0, 1)`.
pub trait Sampler: Send + Sync {
    fn draw(&self) -> f64;
}

impl<F> Sampler for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn draw(&self) -> f64 {
        self()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsSampler;

impl Sampler for OsSampler {
    fn draw(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Returns the same draw every time.
#[derive(Debug, Clone, Copy)]
pub struct FixedSampler(pub f64);

impl Sampler for FixedSampler {
    fn draw(&self) -> f64 {
        self.0
    }
}

#[derive(Debug)]
pub struct SeededSampler {
    rng: Mutex<ChaCha8Rng>,
}

impl SeededSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }
}

impl Sampler for SeededSampler {
    fn draw(&self) -> f64 {
        self.rng.lock().gen::<f64>()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingRule {
    pub rate: f64,
    #[serde(default)]
    pub role_overrides: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u64>,
}

impl SamplingRule {
    pub fn rate(rate: f64) -> Self {
        Self {
            rate,
            role_overrides: BTreeMap::new(),
            retention_days: None,
        }
    }

    pub fn with_role_override(mut self, role: impl Into<String>, rate: f64) -> Self {
        self.role_overrides.insert(role.into(), rate);
        self
    }

    pub fn with_retention_days(mut self, days: u64) -> Self {
        self.retention_days = Some(days);
        self
    }
}

/// On-disk form of the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditPolicyFile {
    pub default_rate: f64,
    pub default_retention_days: Option<u64>,
    /// Added to the built-in critical set; cannot remove from it.
    pub critical_event_types: Vec<String>,
    pub rules: BTreeMap<String, SamplingRule>,
}

impl Default for AuditPolicyFile {
    fn default() -> Self {
        Self {
            default_rate: 1.0,
            default_retention_days: None,
            critical_event_types: Vec::new(),
            rules: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyDecision {
    pub keep: bool,
    pub rate: f64,
    pub critical: bool,
}

#[derive(Debug, Clone)]
pub struct AuditPolicy {
    critical: BTreeSet<String>,
    default_rate: f64,
    default_retention_days: Option<u64>,
    rules: BTreeMap<String, SamplingRule>,
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self::from_file(AuditPolicyFile::default())
    }
}

impl AuditPolicy {
    pub fn from_file(file: AuditPolicyFile) -> Self {
        let mut critical: BTreeSet<String> = DEFAULT_CRITICAL_EVENT_TYPES
            .iter()
            .map(|s| s.to_string())
            .collect();
        critical.extend(file.critical_event_types);
        Self {
            critical,
            default_rate: file.default_rate,
            default_retention_days: file.default_retention_days,
            rules: file.rules,
        }
    }

    pub fn load_from_json(path: impl AsRef<Path>) -> WardenResult<Self> {
        let path = path.as_ref();
        let payload = fs::read(path)
            .map_err(|e| WardenError::Storage(format!("read {}: {e}", path.display())))?;
        let file: AuditPolicyFile = serde_json::from_slice(&payload)
            .map_err(|e| WardenError::validation(format!("invalid audit policy: {e}")))?;
        Ok(Self::from_file(file))
    }

    pub fn with_rule(mut self, event_type: impl Into<String>, rule: SamplingRule) -> Self {
        self.rules.insert(event_type.into(), rule);
        self
    }

    pub fn with_default_rate(mut self, rate: f64) -> Self {
        self.default_rate = rate;
        self
    }

    pub fn with_default_retention_days(mut self, days: u64) -> Self {
        self.default_retention_days = Some(days);
        self
    }

    pub fn with_critical(mut self, event_type: impl Into<String>) -> Self {
        self.critical.insert(event_type.into());
        self
    }

    pub fn is_critical(&self, event_type: &str) -> bool {
        self.critical.contains(event_type)
    }

    pub fn critical_event_types(&self) -> Vec<String> {
        self.critical.iter().cloned().collect()
    }

    /// Resolved keep probability, clamped to `[0, 1]`.
    pub fn sample_rate(&self, event_type: &str, principal: &Principal) -> f64 {
        if self.is_critical(event_type) {
            return 1.0;
        }
        let rate = match self.rules.get(event_type) {
            Some(rule) => principal
                .roles
                .iter()
                .filter_map(|role| rule.role_overrides.get(role).copied())
                .map(|r| if r.is_nan() { 1.0 } else { r })
                .reduce(f64::max)
                .unwrap_or(rule.rate),
            None => self.default_rate,
        };
        if rate.is_nan() {
            1.0
        } else {
            rate.clamp(0.0, 1.0)
        }
    }

    pub fn retention_ms(&self, event_type: &str) -> Option<u64> {
        self.rules
            .get(event_type)
            .and_then(|r| r.retention_days)
            .or(self.default_retention_days)
            .map(|days| days.saturating_mul(MS_PER_DAY))
    }

    pub fn decide(
        &self,
        event_type: &str,
        principal: &Principal,
        sampler: &dyn Sampler,
    ) -> PolicyDecision {
        let critical = self.is_critical(event_type);
        let rate = self.sample_rate(event_type, principal);
        let keep = if rate >= 1.0 {
            true
        } else if rate <= 0.0 {
            false
        } else {
            sampler.draw() < rate
        };
        PolicyDecision {
            keep,
            rate,
            critical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anyone() -> Principal {
        Principal::new("u-1")
    }

    #[test]
    fn critical_types_ignore_configuration() {
        let policy = AuditPolicy::default().with_rule("multisig.applied", SamplingRule::rate(0.0));
        let d = policy.decide("multisig.applied", &anyone(), &FixedSampler(0.99));
        assert!(d.keep && d.critical);
        assert_eq!(d.rate, 1.0);
    }

    #[test]
    fn rates_are_clamped_and_nan_keeps() {
        let policy = AuditPolicy::default()
            .with_rule("a", SamplingRule::rate(7.0))
            .with_rule("b", SamplingRule::rate(-3.0))
            .with_rule("c", SamplingRule::rate(f64::NAN));
        assert_eq!(policy.sample_rate("a", &anyone()), 1.0);
        assert_eq!(policy.sample_rate("b", &anyone()), 0.0);
        assert_eq!(policy.sample_rate("c", &anyone()), 1.0);
    }

    #[test]
    fn highest_role_override_wins() {
        let policy = AuditPolicy::default().with_rule(
            "package.viewed",
            SamplingRule::rate(0.1)
                .with_role_override("auditor", 0.9)
                .with_role_override("admin", 0.5),
        );
        let p = Principal::new("x").with_roles(["admin", "auditor"]);
        assert_eq!(policy.sample_rate("package.viewed", &p), 0.9);
        let q = Principal::new("y").with_roles(["viewer"]);
        assert_eq!(policy.sample_rate("package.viewed", &q), 0.1);
    }

    #[test]
    fn draw_is_compared_against_rate() {
        let policy = AuditPolicy::default().with_rule("e", SamplingRule::rate(0.5));
        assert!(policy.decide("e", &anyone(), &FixedSampler(0.49)).keep);
        assert!(!policy.decide("e", &anyone(), &FixedSampler(0.5)).keep);
        let closure = || 0.1_f64;
        assert!(policy.decide("e", &anyone(), &closure).keep);
    }

    #[test]
    fn retention_prefers_rule_then_default() {
        let policy = AuditPolicy::default()
            .with_default_retention_days(30)
            .with_rule("short", SamplingRule::rate(1.0).with_retention_days(1));
        assert_eq!(policy.retention_ms("short"), Some(MS_PER_DAY));
        assert_eq!(policy.retention_ms("other"), Some(30 * MS_PER_DAY));
        assert_eq!(AuditPolicy::default().retention_ms("other"), None);
    }

    #[test]
    fn policy_file_can_extend_critical_set() {
        let file: AuditPolicyFile = serde_json::from_str(
            r#"{"defaultRate":0.0,"criticalEventTypes":["tenant.deleted"],"rules":{"x":{"rate":0.2,"roleOverrides":{"ops":1.0}}}}"#,
        )
        .unwrap();
        let policy = AuditPolicy::from_file(file);
        assert!(policy.is_critical("tenant.deleted"));
        assert!(policy.is_critical("multisig.applied"));
        assert_eq!(policy.sample_rate("unlisted", &anyone()), 0.0);
    }

    #[test]
    fn seeded_sampler_is_reproducible() {
        let a = SeededSampler::new(42);
        let b = SeededSampler::new(42);
        for _ in 0..16 {
            let x = a.draw();
            assert_eq!(x, b.draw());
            assert!((0.0..1.0).contains(&x));
        }
    }
}
