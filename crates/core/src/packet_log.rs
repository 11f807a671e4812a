#![forbid(unsafe_code)]

use crate::error::SnapshotError;
use crate::types::{Action, HookPoint, PacketInfo, Reason, Timestamp, Verdict};
use std::net::Ipv4Addr;

pub const MAX_LOGS: usize = 1000;

const LINE_FIELDS: usize = 10;

/// One aggregated firewall decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: Timestamp,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub hook: HookPoint,
    pub action: Action,
    pub reason: Reason,
    pub count: u32,
}

impl LogEntry {
    pub fn new(packet: &PacketInfo, hook: HookPoint, verdict: Verdict, now: Timestamp) -> Self {
        LogEntry {
            timestamp: now,
            src_ip: packet.src_ip,
            dst_ip: packet.dst_ip,
            src_port: packet.src_port.unwrap_or(0),
            dst_port: packet.dst_port.unwrap_or(0),
            protocol: packet.protocol.as_u8(),
            hook,
            action: verdict.action,
            reason: verdict.reason,
            count: 1,
        }
    }

    /// Same flow and decision; ports only count for TCP and UDP.
    fn same_event(&self, other: &LogEntry) -> bool {
        let ports_matter = matches!(self.protocol, 6 | 17);
        self.src_ip == other.src_ip
            && self.dst_ip == other.dst_ip
            && self.protocol == other.protocol
            && self.hook == other.hook
            && self.action == other.action
            && self.reason == other.reason
            && (!ports_matter
                || (self.src_port == other.src_port && self.dst_port == other.dst_port))
    }

    /// `timestamp src_ip dst_ip src_port dst_port protocol hook action reason count`
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {} {} {} {} {} {}",
            self.timestamp,
            u32::from(self.src_ip),
            u32::from(self.dst_ip),
            self.src_port,
            self.dst_port,
            self.protocol,
            self.hook.code(),
            self.action.code(),
            self.reason.code(),
            self.count
        )
    }

    pub fn from_line(line: &str) -> Result<Self, SnapshotError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != LINE_FIELDS {
            return Err(SnapshotError::FieldCount {
                expected: LINE_FIELDS,
                found: fields.len(),
            });
        }
        fn num<T: std::str::FromStr>(value: &str, field: &'static str) -> Result<T, SnapshotError> {
            value.parse().map_err(|_| SnapshotError::field(field, value))
        }
        Ok(LogEntry {
            timestamp: num(fields[0], "timestamp")?,
            src_ip: Ipv4Addr::from(num::<u32>(fields[1], "source address")?),
            dst_ip: Ipv4Addr::from(num::<u32>(fields[2], "destination address")?),
            src_port: num(fields[3], "source port")?,
            dst_port: num(fields[4], "destination port")?,
            protocol: num(fields[5], "protocol")?,
            hook: HookPoint::from_code(num(fields[6], "hook")?)
                .ok_or_else(|| SnapshotError::field("hook", fields[6]))?,
            action: Action::from_code(num(fields[7], "action")?)
                .ok_or_else(|| SnapshotError::field("action", fields[7]))?,
            reason: Reason::from_code(num(fields[8], "reason")?)
                .ok_or_else(|| SnapshotError::field("reason", fields[8]))?,
            count: num(fields[9], "count")?,
        })
    }
}

/// Bounded log of decisions. Repeats of an existing entry bump its count;
/// when full, the entry with the oldest timestamp is overwritten.
#[derive(Debug, Clone)]
pub struct PacketLog {
    entries: Vec<LogEntry>,
    capacity: usize,
}

impl Default for PacketLog {
    fn default() -> Self {
        PacketLog::new(MAX_LOGS)
    }
}

impl PacketLog {
    pub fn new(capacity: usize) -> Self {
        PacketLog {
            entries: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, entry: LogEntry) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.same_event(&entry)) {
            existing.count = existing.count.saturating_add(entry.count);
            existing.timestamp = existing.timestamp.max(entry.timestamp);
            return;
        }
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
            return;
        }
        if let Some(oldest) = self.entries.iter_mut().min_by_key(|e| e.timestamp) {
            *oldest = entry;
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Reload exported entries, keeping at most `capacity`.
    pub fn restore(&mut self, entries: Vec<LogEntry>) {
        self.entries = entries;
        self.entries.truncate(self.capacity);
    }
}
