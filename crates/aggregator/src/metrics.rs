use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::applier::ApplyOutcome;

/// Engine and boundary counters, shared between the engine task, the
/// ingestion adapter and the metrics endpoint.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    events_applied: AtomicU64,
    events_stale: AtomicU64,
    events_ignored: AtomicU64,
    events_absent: AtomicU64,
    occupancy_reports: AtomicU64,
    drift_detected: AtomicU64,
    resync_requests: AtomicU64,
    resync_failures: AtomicU64,
    members_pruned: AtomicU64,
    deliveries_acked: AtomicU64,
    deliveries_rejected: AtomicU64,
    envelopes_malformed: AtomicU64,
    publish_failures: AtomicU64,
    channels: AtomicU64,
    members: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_applied: u64,
    pub events_stale: u64,
    pub events_ignored: u64,
    pub events_absent: u64,
    pub occupancy_reports: u64,
    pub drift_detected: u64,
    pub resync_requests: u64,
    pub resync_failures: u64,
    pub members_pruned: u64,
    pub deliveries_acked: u64,
    pub deliveries_rejected: u64,
    pub envelopes_malformed: u64,
    pub publish_failures: u64,
    pub channels: u64,
    pub members: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl EngineMetrics {
    pub fn record_apply(&self, outcome: ApplyOutcome) {
        let counter = match outcome {
            ApplyOutcome::Inserted
            | ApplyOutcome::Refreshed
            | ApplyOutcome::Removed
            | ApplyOutcome::ChannelRemoved => &self.events_applied,
            ApplyOutcome::Stale => &self.events_stale,
            ApplyOutcome::Ignored => &self.events_ignored,
            ApplyOutcome::Absent => &self.events_absent,
        };
        bump(counter, 1);
    }

    pub fn record_occupancy_report(&self) {
        bump(&self.occupancy_reports, 1);
    }

    pub fn record_drift(&self) {
        bump(&self.drift_detected, 1);
    }

    pub fn record_resync_request(&self) {
        bump(&self.resync_requests, 1);
    }

    pub fn record_resync_failure(&self) {
        bump(&self.resync_failures, 1);
    }

    pub fn record_members_pruned(&self, count: u64) {
        bump(&self.members_pruned, count);
    }

    pub fn record_ack(&self) {
        bump(&self.deliveries_acked, 1);
    }

    pub fn record_reject(&self) {
        bump(&self.deliveries_rejected, 1);
    }

    pub fn record_malformed(&self) {
        bump(&self.envelopes_malformed, 1);
    }

    pub fn record_publish_failure(&self) {
        bump(&self.publish_failures, 1);
    }

    pub fn set_store_size(&self, channels: usize, members: usize) {
        self.channels.store(channels as u64, Ordering::Relaxed);
        self.members.store(members as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            events_applied: load(&self.events_applied),
            events_stale: load(&self.events_stale),
            events_ignored: load(&self.events_ignored),
            events_absent: load(&self.events_absent),
            occupancy_reports: load(&self.occupancy_reports),
            drift_detected: load(&self.drift_detected),
            resync_requests: load(&self.resync_requests),
            resync_failures: load(&self.resync_failures),
            members_pruned: load(&self.members_pruned),
            deliveries_acked: load(&self.deliveries_acked),
            deliveries_rejected: load(&self.deliveries_rejected),
            envelopes_malformed: load(&self.envelopes_malformed),
            publish_failures: load(&self.publish_failures),
            channels: load(&self.channels),
            members: load(&self.members),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut output = String::new();

        let counters: [(&str, &str, u64); 13] = [
            ("presence_events_applied_total", "Presence events that changed membership.", s.events_applied),
            ("presence_events_stale_total", "Presence events discarded as older than the member state.", s.events_stale),
            ("presence_events_ignored_total", "Presence events with an unrecognized action.", s.events_ignored),
            ("presence_events_absent_total", "Leave events for members that were not tracked.", s.events_absent),
            ("presence_occupancy_reports_total", "Occupancy reports recorded for tracked channels.", s.occupancy_reports),
            ("presence_drift_detected_total", "Verifications that found a member count mismatch.", s.drift_detected),
            ("presence_resync_requests_total", "Presence snapshot requests issued.", s.resync_requests),
            ("presence_resync_failures_total", "Presence snapshot requests that failed.", s.resync_failures),
            ("presence_members_pruned_total", "Members removed because a snapshot no longer listed them.", s.members_pruned),
            ("presence_deliveries_acked_total", "Queue deliveries acknowledged.", s.deliveries_acked),
            ("presence_deliveries_rejected_total", "Queue deliveries rejected.", s.deliveries_rejected),
            ("presence_envelopes_malformed_total", "Queue deliveries that could not be decoded.", s.envelopes_malformed),
            ("presence_publish_failures_total", "Aggregate publications that failed.", s.publish_failures),
        ];
        for (name, help, value) in counters {
            append_metric(&mut output, name, help, "counter", value);
        }

        append_metric(&mut output, "presence_channels", "Channels currently tracked.", "gauge", s.channels);
        append_metric(&mut output, "presence_members", "Members currently tracked.", "gauge", s.members);
        output
    }
}

fn append_metric(output: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
    let _ = writeln!(output, "{name} {value}");
}
