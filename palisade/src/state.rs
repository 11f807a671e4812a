use anyhow::{Context, Result};
use fs4::fs_std::FileExt;
use palisade_config::ConfigPaths;
use palisade_core::{Connection, Firewall, LogEntry, SnapshotError, Timestamp};
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use tracing::debug;
use utils::enforce_writable;

/// Firewall state kept between invocations: the active flag, the connection
/// table and the packet log, one record per line.
pub struct StateStore<'a> {
    paths: &'a ConfigPaths,
}

impl<'a> StateStore<'a> {
    pub fn new(paths: &'a ConfigPaths) -> Self {
        StateStore { paths }
    }

    pub fn load(&self, firewall: &Firewall) -> Result<()> {
        let active = read_optional(&self.paths.active_flag)?
            .is_some_and(|body| body.trim() == "1");
        firewall.set_active(active);

        let connections = read_records(&self.paths.connections_snapshot, Connection::from_line)?;
        let restored = firewall.connections().restore(connections);

        let entries = read_records(&self.paths.packet_log, LogEntry::from_line)?;
        let logged = entries.len();
        firewall.restore_log(entries);

        debug!(active, connections = restored, log_entries = logged, "state loaded");
        Ok(())
    }

    pub fn save(&self, firewall: &Firewall, now: Timestamp) -> Result<()> {
        let active = if firewall.is_active() { "1\n" } else { "0\n" };
        write_state(&self.paths.active_flag, active.to_string())?;

        let connections = firewall.connections().snapshot(now);
        write_state(
            &self.paths.connections_snapshot,
            join_lines(connections.iter().map(Connection::to_line)),
        )?;

        let entries = firewall.log_entries();
        write_state(
            &self.paths.packet_log,
            join_lines(entries.iter().map(LogEntry::to_line)),
        )?;
        debug!(connections = connections.len(), log_entries = entries.len(), "state saved");
        Ok(())
    }
}

/// Exclusive advisory lock on `state/lock`. Held from load to save, it makes
/// concurrent invocations on one root take turns instead of overwriting each
/// other's snapshot. Released when dropped.
#[derive(Debug)]
pub struct StateLock {
    _file: File,
}

impl StateLock {
    /// Blocks until no other holder remains.
    pub fn acquire(paths: &ConfigPaths) -> Result<Self> {
        let path = &paths.state_lock;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open state lock {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock state {}", path.display()))?;
        debug!(path = %path.display(), "state lock held");
        Ok(StateLock { _file: file })
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .with_context(|| format!("read state {}", path.display()))
}

fn read_records<T>(path: &Path, parse: fn(&str) -> Result<T, SnapshotError>) -> Result<Vec<T>> {
    let Some(body) = read_optional(path)? else {
        return Ok(Vec::new());
    };
    body.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            parse(line).with_context(|| format!("{} line {}", path.display(), idx + 1))
        })
        .collect()
}

fn join_lines(lines: impl Iterator<Item = String>) -> String {
    let mut body = String::new();
    for line in lines {
        body.push_str(&line);
        body.push('\n');
    }
    body
}

fn write_state(path: &Path, body: String) -> Result<()> {
    enforce_writable(path)?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    }
    fs::write(path, body).with_context(|| format!("write state {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_parser::IpProtocol;
    use palisade_core::{FirewallSettings, HookPoint, PacketInfo, Reason, Verdict};
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample_info() -> PacketInfo {
        PacketInfo {
            src_ip: Ipv4Addr::new(10, 1, 1, 7),
            dst_ip: Ipv4Addr::new(10, 1, 2, 9),
            protocol: IpProtocol::Udp,
            src_port: Some(5353),
            dst_port: Some(53),
            tcp_flags: None,
        }
    }

    #[test]
    fn fresh_root_loads_inactive_and_empty() {
        let dir = tempdir().unwrap();
        let paths = ConfigPaths::new(dir.path().to_path_buf());
        let fw = Firewall::new(FirewallSettings::default());
        fw.set_active(true);
        StateStore::new(&paths).load(&fw).unwrap();
        assert!(!fw.is_active());
        assert_eq!(fw.connection_count(), 0);
        assert_eq!(fw.log_count(), 0);
    }

    #[test]
    fn state_survives_a_save_load_cycle() {
        let dir = tempdir().unwrap();
        let paths = ConfigPaths::new(dir.path().to_path_buf());
        let store = StateStore::new(&paths);

        let fw = Firewall::new(FirewallSettings::default());
        fw.set_active(true);
        let mut conn = Connection::new(
            "10.1.1.7:1234".parse().unwrap(),
            "10.1.2.9:80".parse().unwrap(),
            100,
        );
        conn.proxied = true;
        conn.proxy_as_server_port = Some(8001);
        fw.connections().insert(conn).unwrap();
        fw.log_decision(&sample_info(), HookPoint::PreRouting, Verdict::drop(Reason::NoMatchingRule), 100);
        store.save(&fw, 100).unwrap();

        let reloaded = Firewall::new(FirewallSettings::default());
        store.load(&reloaded).unwrap();
        assert!(reloaded.is_active());
        assert_eq!(
            reloaded.connections().snapshot(100),
            fw.connections().snapshot(100)
        );
        assert_eq!(reloaded.log_entries(), fw.log_entries());
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let dir = tempdir().unwrap();
        let paths = ConfigPaths::new(dir.path().to_path_buf());
        fs::create_dir_all(&paths.state_dir).unwrap();
        fs::write(&paths.connections_snapshot, "1 2 3\n").unwrap();
        let fw = Firewall::new(FirewallSettings::default());
        let err = StateStore::new(&paths).load(&fw).unwrap_err();
        assert!(format!("{err:#}").contains("line 1"));
    }

    #[test]
    fn second_holder_waits_for_the_first() {
        let dir = tempdir().unwrap();
        let paths = ConfigPaths::new(dir.path().to_path_buf());
        let held = StateLock::acquire(&paths).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let paths = paths.clone();
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _lock = StateLock::acquire(&paths).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(200));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(held);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
