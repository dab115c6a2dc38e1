use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct TelemetryState {
    audit_appends_total: BTreeMap<(String, String), u64>,
    signer_fallbacks_total: u64,
    errors_total: BTreeMap<String, u64>,
    idempotent_replays_total: BTreeMap<String, u64>,
    approvals_total: BTreeMap<String, u64>,
    gc_deleted_total: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    state: Arc<Mutex<TelemetryState>>,
}

fn bump<K: Ord>(map: &mut BTreeMap<K, u64>, key: K, by: u64) {
    let entry = map.entry(key).or_insert(0);
    *entry = entry.saturating_add(by);
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_audit_append(&self, event_type: &str, sampled: bool) {
        let outcome = if sampled { "sampled" } else { "kept" };
        let mut guard = self.state.lock();
        bump(
            &mut guard.audit_appends_total,
            (event_type.to_string(), outcome.to_string()),
            1,
        );
    }

    pub fn record_signer_fallback(&self) {
        let mut guard = self.state.lock();
        guard.signer_fallbacks_total = guard.signer_fallbacks_total.saturating_add(1);
    }

    pub fn record_error(&self, code: &str) {
        bump(&mut self.state.lock().errors_total, code.to_string(), 1);
    }

    pub fn record_idempotent_replay(&self, route: &str) {
        bump(
            &mut self.state.lock().idempotent_replays_total,
            route.to_string(),
            1,
        );
    }

    pub fn record_approval(&self, decision: &str) {
        bump(&mut self.state.lock().approvals_total, decision.to_string(), 1);
    }

    pub fn record_gc_deleted(&self, kind: &str, count: usize) {
        if count == 0 {
            return;
        }
        bump(
            &mut self.state.lock().gc_deleted_total,
            kind.to_string(),
            count as u64,
        );
    }

    pub fn render(&self) -> String {
        let guard = self.state.lock();
        let mut out = String::new();
        out.push_str("# TYPE warden_audit_appends_total counter\n");
        for ((event_type, outcome), value) in &guard.audit_appends_total {
            let _ = writeln!(
                out,
                "warden_audit_appends_total{{event_type=\"{}\",outcome=\"{}\"}} {}",
                event_type, outcome, value
            );
        }
        out.push_str("# TYPE warden_signer_fallbacks_total counter\n");
        let _ = writeln!(
            out,
            "warden_signer_fallbacks_total {}",
            guard.signer_fallbacks_total
        );
        out.push_str("# TYPE warden_errors_total counter\n");
        for (code, value) in &guard.errors_total {
            let _ = writeln!(out, "warden_errors_total{{code=\"{}\"}} {}", code, value);
        }
        out.push_str("# TYPE warden_idempotent_replays_total counter\n");
        for (route, value) in &guard.idempotent_replays_total {
            let _ = writeln!(
                out,
                "warden_idempotent_replays_total{{route=\"{}\"}} {}",
                route, value
            );
        }
        out.push_str("# TYPE warden_approvals_total counter\n");
        for (decision, value) in &guard.approvals_total {
            let _ = writeln!(
                out,
                "warden_approvals_total{{decision=\"{}\"}} {}",
                decision, value
            );
        }
        out.push_str("# TYPE warden_gc_deleted_total counter\n");
        for (kind, value) in &guard.gc_deleted_total {
            let _ = writeln!(out, "warden_gc_deleted_total{{kind=\"{}\"}} {}", kind, value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_counters() {
        let t = Telemetry::new();
        t.record_audit_append("package.published", false);
        t.record_audit_append("page.viewed", true);
        t.record_audit_append("page.viewed", true);
        t.record_signer_fallback();
        t.record_error("SIGNER_UNAVAILABLE");
        t.record_idempotent_replay("/v1/approvals");
        t.record_approval("approved");
        t.record_gc_deleted("audit", 7);
        t.record_gc_deleted("idempotency", 0);

        let text = t.render();
        assert!(text.contains(
            "warden_audit_appends_total{event_type=\"page.viewed\",outcome=\"sampled\"} 2"
        ));
        assert!(text.contains(
            "warden_audit_appends_total{event_type=\"package.published\",outcome=\"kept\"} 1"
        ));
        assert!(text.contains("warden_signer_fallbacks_total 1"));
        assert!(text.contains("warden_errors_total{code=\"SIGNER_UNAVAILABLE\"} 1"));
        assert!(text.contains("warden_idempotent_replays_total{route=\"/v1/approvals\"} 1"));
        assert!(text.contains("warden_approvals_total{decision=\"approved\"} 1"));
        assert!(text.contains("warden_gc_deleted_total{kind=\"audit\"} 7"));
        assert!(!text.contains("kind=\"idempotency\""));
    }
}
