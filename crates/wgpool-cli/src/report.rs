//! Human and JSON renderings of connection status

use serde::Serialize;
use std::fmt::Write;
use wgpool_lib::{ConnectionRecord, PoolStatus, Reconciliation, ReconciliationSummary};

/// `status --json` payload
#[derive(Debug, Serialize)]
pub struct StatusReport<'a> {
    pub summary: ReconciliationSummary,
    #[serde(flatten)]
    pub details: &'a Reconciliation,
}

impl<'a> StatusReport<'a> {
    pub fn new(details: &'a Reconciliation) -> Self {
        Self {
            summary: details.summary(),
            details,
        }
    }
}

/// One-line verdict on a reconciliation
pub fn verdict(summary: &ReconciliationSummary) -> String {
    match (summary.orphaned, summary.untracked) {
        (0, 0) => "✅ All clear".to_string(),
        (orphaned, 0) => format!(
            "⚠️  {} orphaned record(s), run `wgpool cleanup`",
            orphaned
        ),
        (0, untracked) => format!(
            "⚠️  {} untracked live tunnel(s), run `wgpool reap`",
            untracked
        ),
        (orphaned, untracked) => format!(
            "⚠️  {} orphaned record(s) and {} untracked live tunnel(s), run `wgpool cleanup` and `wgpool reap`",
            orphaned, untracked
        ),
    }
}

fn record_line(out: &mut String, record: &ConnectionRecord) {
    let _ = writeln!(
        out,
        "  {:<6} {:<8} {:<18} {:<16} since {}",
        record.worker_id.as_str(),
        record.interface_name,
        record.internal_address,
        record.endpoint_address,
        record.registered_at.format("%Y-%m-%d %H:%M:%S UTC"),
    );
}

/// Text rendering of `wgpool status`
pub fn render_status(reconciliation: &Reconciliation) -> String {
    let summary = reconciliation.summary();
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Connections: {} active, {} orphaned, {} untracked",
        summary.active, summary.orphaned, summary.untracked
    );

    if !reconciliation.active.is_empty() {
        out.push_str("\nActive:\n");
        for record in &reconciliation.active {
            record_line(&mut out, record);
        }
    }
    if !reconciliation.orphaned.is_empty() {
        out.push_str("\nOrphaned (interface gone):\n");
        for record in &reconciliation.orphaned {
            record_line(&mut out, record);
        }
    }
    if !reconciliation.untracked.is_empty() {
        out.push_str("\nUntracked live interfaces:\n");
        for name in &reconciliation.untracked {
            let _ = writeln!(out, "  {}", name);
        }
    }

    let _ = writeln!(out, "\n{}", verdict(&summary));
    out
}

/// Text rendering of `wgpool pool status`
pub fn render_pool_status(status: &PoolStatus) -> String {
    let stats = &status.statistics;
    format!(
        "Keys: {} total, {} in use, {} available\nActive connections on server: {}\n",
        stats.total,
        stats.in_use,
        stats.available,
        status.active_connections.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use wgpool_lib::WorkerId;

    fn record(worker: &str) -> ConnectionRecord {
        let worker_id = WorkerId::new(worker).unwrap();
        ConnectionRecord {
            interface_name: worker_id.interface_name(),
            worker_id,
            internal_address: "10.8.0.21".to_string(),
            endpoint_address: "203.0.113.7".to_string(),
            config_path: PathBuf::from("/etc/wgpool/tunnels/wgA.conf"),
            public_key: "PKabc".to_string(),
            registered_at: "2026-10-18T09:30:00Z".parse().unwrap(),
            pid: 4242,
        }
    }

    fn summary(active: usize, orphaned: usize, untracked: usize) -> ReconciliationSummary {
        ReconciliationSummary {
            active,
            orphaned,
            untracked,
        }
    }

    #[test]
    fn test_verdicts() {
        assert_eq!(verdict(&summary(3, 0, 0)), "✅ All clear");
        assert!(verdict(&summary(1, 2, 0)).contains("wgpool cleanup"));
        assert!(verdict(&summary(1, 0, 1)).contains("wgpool reap"));

        let both = verdict(&summary(0, 1, 1));
        assert!(both.contains("cleanup") && both.contains("reap"));
    }

    #[test]
    fn test_render_status() {
        let reconciliation = Reconciliation {
            active: vec![record("A")],
            orphaned: Vec::new(),
            untracked: vec!["wg109".to_string()],
        };

        let text = render_status(&reconciliation);
        assert!(text.starts_with("Connections: 1 active, 0 orphaned, 1 untracked\n"));
        assert!(text.contains("wgA"));
        assert!(text.contains("10.8.0.21"));
        assert!(text.contains("since 2026-10-18 09:30:00 UTC"));
        assert!(text.contains("Untracked live interfaces:\n  wg109\n"));
        assert!(text.trim_end().ends_with("run `wgpool reap`"));
    }

    #[test]
    fn test_status_report_json() {
        let reconciliation = Reconciliation {
            active: vec![record("A")],
            orphaned: Vec::new(),
            untracked: Vec::new(),
        };

        let json = serde_json::to_value(StatusReport::new(&reconciliation)).unwrap();
        assert_eq!(json["summary"]["active"], 1);
        assert_eq!(json["summary"]["orphaned"], 0);
        assert_eq!(json["active"][0]["interface_name"], "wgA");
        assert_eq!(json["untracked"], serde_json::json!([]));
    }
}
