//! Aggregated view of the event stream printed at the end of a run.

use mplsim_node::{DiscardReason, EventKind, SimEvent};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Event counters
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    /// Events seen
    pub events: u64,
    /// Last simulated instant an event was reported at
    pub last_ns: u64,
    /// Packets generated per kind
    pub generated: BTreeMap<String, u64>,
    /// Packets put on links per kind
    pub sent: BTreeMap<String, u64>,
    /// Packets consumed by receivers per kind
    pub received: BTreeMap<String, u64>,
    /// Packets switched per kind
    pub routed: BTreeMap<String, u64>,
    /// Packets dropped per reason
    pub discarded: BTreeMap<String, u64>,
    /// Highest port occupancy reported
    pub peak_congestion: u32,
}

fn bump(counts: &mut BTreeMap<String, u64>, key: String) {
    *counts.entry(key).or_default() += 1;
}

impl EventSummary {
    /// Account for one event
    pub fn record(&mut self, event: &SimEvent) {
        self.events += 1;
        self.last_ns = self.last_ns.max(event.time_ns);
        match &event.kind {
            EventKind::PacketGenerated { packet, .. } => bump(&mut self.generated, packet.to_string()),
            EventKind::PacketSent { packet, .. } => bump(&mut self.sent, packet.to_string()),
            EventKind::PacketRouted { packet } => bump(&mut self.routed, packet.to_string()),
            EventKind::PacketReceived { packet, .. } => bump(&mut self.received, packet.to_string()),
            EventKind::PacketDiscarded { reason, .. } => bump(&mut self.discarded, reason.to_string()),
            EventKind::NodeCongested { percent } => {
                self.peak_congestion = self.peak_congestion.max(*percent);
            }
        }
    }

    /// Packets dropped because of `reason`
    pub fn discarded_for(&self, reason: DiscardReason) -> u64 {
        self.discarded.get(&reason.to_string()).copied().unwrap_or(0)
    }

    /// Share of generated packets that reached a receiver
    pub fn delivery_ratio(&self) -> Option<f64> {
        let generated: u64 = self.generated.values().sum();
        let received: u64 = self.received.values().sum();
        (generated > 0).then(|| received as f64 / generated as f64)
    }
}

fn write_counts(f: &mut fmt::Formatter<'_>, title: &str, counts: &BTreeMap<String, u64>) -> fmt::Result {
    if counts.is_empty() {
        return Ok(());
    }
    writeln!(f, "  {}:", title)?;
    for (key, count) in counts {
        writeln!(f, "    {:<20} {:>10}", key, count)?;
    }
    Ok(())
}

impl fmt::Display for EventSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} events up to {} ns", self.events, self.last_ns)?;
        write_counts(f, "generated", &self.generated)?;
        write_counts(f, "sent", &self.sent)?;
        write_counts(f, "routed", &self.routed)?;
        write_counts(f, "received", &self.received)?;
        write_counts(f, "discarded", &self.discarded)?;
        writeln!(f, "  peak congestion: {}%", self.peak_congestion)?;
        if let Some(ratio) = self.delivery_ratio() {
            writeln!(f, "  delivery ratio: {:.1}%", ratio * 100.0)?;
        }
        Ok(())
    }
}
