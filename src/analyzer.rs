use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;

use crate::format::format_packet;
use crate::protocol::packet::{format_timestamp, Packet};
use crate::session::PacketSink;

/// All packets ever observed that share one structural signature.
#[derive(Clone, Debug)]
pub struct PacketGroup {
    pub signature: String,
    pub count: u64,
    pub first_seen: OffsetDateTime,
    pub last_seen: OffsetDateTime,
    /// The first observation.
    pub example: Arc<Packet>,
    /// Retained observations, oldest first. May be bounded; `count` and
    /// `last_seen` track the true totals regardless of eviction.
    pub all: VecDeque<Arc<Packet>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AnalyzerStats {
    pub total: u64,
    pub groups: usize,
}

/// Groups observed packets by signature and accumulates per-group
/// statistics for reporting.
pub struct PacketAnalyzer {
    groups: HashMap<String, PacketGroup>,
    total: u64,
    history_limit: Option<usize>,
}

impl PacketAnalyzer {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
            total: 0,
            history_limit: None,
        }
    }

    /// Bound the per-group retained history; oldest entries are evicted
    /// first once a group exceeds `limit`.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            history_limit: Some(limit),
            ..Self::new()
        }
    }

    pub fn observe(&mut self, packet: &Arc<Packet>) {
        self.total += 1;

        let signature = packet.signature();
        let group = self
            .groups
            .entry(signature.clone())
            .or_insert_with(|| PacketGroup {
                signature,
                count: 0,
                first_seen: packet.timestamp,
                last_seen: packet.timestamp,
                example: packet.clone(),
                all: VecDeque::new(),
            });

        group.count += 1;
        group.last_seen = packet.timestamp;
        group.all.push_back(packet.clone());

        if let Some(limit) = self.history_limit {
            while group.all.len() > limit {
                group.all.pop_front();
            }
        }
    }

    pub fn stats(&self) -> AnalyzerStats {
        AnalyzerStats {
            total: self.total,
            groups: self.groups.len(),
        }
    }

    pub fn group(&self, signature: &str) -> Option<&PacketGroup> {
        self.groups.get(signature)
    }

    /// Groups sorted by count descending, ties by first sighting.
    pub fn sorted_groups(&self) -> Vec<&PacketGroup> {
        let mut groups: Vec<&PacketGroup> = self.groups.values().collect();
        groups.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.first_seen.cmp(&b.first_seen))
        });
        groups
    }

    pub fn report(&self) -> String {
        let stats = self.stats();
        let mut out = String::new();

        let _ = writeln!(
            out,
            "packet report: {} packets in {} groups",
            stats.total, stats.groups
        );

        for (rank, group) in self.sorted_groups().iter().enumerate() {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "#{} {} -- {} packets",
                rank + 1,
                group.signature,
                group.count
            );
            let _ = writeln!(
                out,
                "   first seen: {}, last seen: {}",
                format_timestamp(group.first_seen),
                format_timestamp(group.last_seen)
            );
            let _ = writeln!(out, "   example: {}", format_packet(&group.example));

            if group.count <= 10 {
                let times = group
                    .all
                    .iter()
                    .map(|p| format_timestamp(p.timestamp))
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = writeln!(out, "   seen at: {times}");
            } else {
                let _ = writeln!(out, "   seen: too many to list ({})", group.count);
            }
        }

        out
    }

    pub fn reset(&mut self) {
        self.groups.clear();
        self.total = 0;
    }
}

impl Default for PacketAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle so the analyzer can be registered as a session
/// sink while the CLI keeps a reporting handle.
#[derive(Clone)]
pub struct SharedAnalyzer(Arc<Mutex<PacketAnalyzer>>);

impl SharedAnalyzer {
    pub fn new(analyzer: PacketAnalyzer) -> Self {
        Self(Arc::new(Mutex::new(analyzer)))
    }

    pub fn report(&self) -> String {
        self.0.lock().expect("analyzer lock").report()
    }

    pub fn stats(&self) -> AnalyzerStats {
        self.0.lock().expect("analyzer lock").stats()
    }

    pub fn reset(&self) {
        self.0.lock().expect("analyzer lock").reset()
    }
}

impl PacketSink for SharedAnalyzer {
    fn on_packet(&self, packet: &Arc<Packet>) {
        self.0.lock().expect("analyzer lock").observe(packet);
    }
}
