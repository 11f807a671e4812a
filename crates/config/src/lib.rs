#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const MAX_BACKUPS_DEFAULT: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no previous versions to roll back to")]
    NoPreviousVersion,

    #[error("backup version {version} not found in {path}")]
    MissingBackup { version: u64, path: PathBuf },
}

impl ConfigError {
    fn io<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> ConfigError + 'a {
        move |source| ConfigError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// On-disk layout under the configuration root.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub root: PathBuf,
    pub rules: PathBuf,
    pub runtime: PathBuf,
    pub state_dir: PathBuf,
    pub connections_snapshot: PathBuf,
    pub packet_log: PathBuf,
    pub active_flag: PathBuf,
    pub state_lock: PathBuf,
    versions_dir: PathBuf,
    meta_file: PathBuf,
}

impl ConfigPaths {
    pub fn new(root: PathBuf) -> Self {
        let rules_dir = root.join("rules");
        let state_dir = root.join("state");
        ConfigPaths {
            rules: rules_dir.join("firewall.rules"),
            runtime: root.join("palisade.yaml"),
            connections_snapshot: state_dir.join("connections.table"),
            packet_log: state_dir.join("packets.log"),
            active_flag: state_dir.join("active"),
            state_lock: state_dir.join("lock"),
            versions_dir: state_dir.join("versions"),
            meta_file: state_dir.join("config_meta"),
            state_dir,
            root,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigMeta {
    pub version: u64,
    pub hash_hex: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub paths: ConfigPaths,
    pub version: u64,
    pub hash_hex: String,
    pub tampered: bool,
}

/// Versions the rule set and runtime config: every recorded version is a
/// hashed, numbered backup that can be rolled back to.
pub struct ConfigManager {
    pub paths: ConfigPaths,
    max_backups: usize,
}

impl ConfigManager {
    pub fn new_with_backups(root: PathBuf, max_backups: usize) -> Result<Self, ConfigError> {
        let paths = ConfigPaths::new(root);
        let mgr = ConfigManager {
            paths,
            max_backups: max_backups.max(1),
        };
        mgr.ensure_layout()?;
        Ok(mgr)
    }

    pub fn new(root: PathBuf) -> Result<Self, ConfigError> {
        Self::new_with_backups(root, MAX_BACKUPS_DEFAULT)
    }

    fn ensure_layout(&self) -> Result<(), ConfigError> {
        let mut dirs = vec![
            self.paths.root.as_path(),
            self.paths.state_dir.as_path(),
            self.paths.versions_dir.as_path(),
        ];
        if let Some(rules_dir) = self.paths.rules.parent() {
            dirs.push(rules_dir);
        }
        for d in dirs {
            fs::create_dir_all(d).map_err(ConfigError::io("create dir", d))?;
        }
        Ok(())
    }

    fn load_meta(&self) -> ConfigMeta {
        let mut meta = ConfigMeta {
            version: 0,
            hash_hex: String::new(),
            updated_at: 0,
        };
        let Ok(buf) = fs::read_to_string(&self.paths.meta_file) else {
            return meta;
        };
        for line in buf.lines() {
            if let Some(rest) = line.strip_prefix("version=") {
                meta.version = rest.trim().parse().unwrap_or(0);
            } else if let Some(rest) = line.strip_prefix("hash=") {
                meta.hash_hex = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("updated_at=") {
                meta.updated_at = rest.trim().parse().unwrap_or(0);
            }
        }
        meta
    }

    fn write_meta(&self, meta: &ConfigMeta) -> Result<(), ConfigError> {
        let path = &self.paths.meta_file;
        let mut f = File::create(path).map_err(ConfigError::io("write meta", path))?;
        let body = format!(
            "version={}\nhash={}\nupdated_at={}\n",
            meta.version, meta.hash_hex, meta.updated_at
        );
        f.write_all(body.as_bytes())
            .map_err(ConfigError::io("write meta", path))
    }

    fn hash_files(&self, files: &[PathBuf]) -> String {
        let mut hasher = Sha256::new();
        for path in files {
            if let Ok(mut f) = File::open(path) {
                hasher.update(path.to_string_lossy().as_bytes());
                let mut buf = [0u8; 8192];
                loop {
                    match f.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => hasher.update(&buf[..n]),
                        Err(_) => break,
                    }
                }
            }
        }
        hex::encode(hasher.finalize())
    }

    fn tracked_files(&self) -> Vec<PathBuf> {
        vec![self.paths.rules.clone(), self.paths.runtime.clone()]
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        let meta = self.load_meta();
        let hash = self.hash_files(&self.tracked_files());
        let tampered = !meta.hash_hex.is_empty() && meta.hash_hex != hash;
        ConfigSnapshot {
            paths: self.paths.clone(),
            version: meta.version,
            hash_hex: hash,
            tampered,
        }
    }

    pub fn record_version(&self) -> Result<ConfigMeta, ConfigError> {
        let mut meta = self.load_meta();
        let tracked = self.tracked_files();
        meta.version = meta.version.saturating_add(1);
        meta.hash_hex = self.hash_files(&tracked);
        meta.updated_at = chrono::Utc::now().timestamp();

        let version_dir = self.paths.versions_dir.join(meta.version.to_string());
        fs::create_dir_all(&version_dir)
            .map_err(ConfigError::io("create version dir", &version_dir))?;
        for path in tracked {
            if let Some(fname) = path.file_name()
                && path.exists()
            {
                let dest = version_dir.join(fname);
                fs::copy(&path, &dest).map_err(ConfigError::io("back up", &path))?;
            }
        }

        self.prune_backups()?;
        self.write_meta(&meta)?;
        info!(version = meta.version, hash = %meta.hash_hex, "configuration version recorded");
        Ok(meta)
    }

    fn prune_backups(&self) -> Result<(), ConfigError> {
        let versions_dir = &self.paths.versions_dir;
        let mut entries: Vec<_> = fs::read_dir(versions_dir)
            .map_err(ConfigError::io("read versions dir", versions_dir))?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_string_lossy()
                    .parse::<u64>()
                    .ok()
                    .map(|ver| (ver, e.path()))
            })
            .collect();
        entries.sort_by_key(|(ver, _)| *ver);
        let excess = entries.len().saturating_sub(self.max_backups);
        for (ver, path) in entries.into_iter().take(excess) {
            debug!(version = ver, "pruning configuration backup");
            let _ = fs::remove_dir_all(path);
        }
        Ok(())
    }

    pub fn rollback(&self) -> Result<ConfigSnapshot, ConfigError> {
        let meta = self.load_meta();
        if meta.version <= 1 {
            return Err(ConfigError::NoPreviousVersion);
        }
        let target_version = meta.version - 1;
        let target_dir = self.paths.versions_dir.join(target_version.to_string());
        if !target_dir.exists() {
            return Err(ConfigError::MissingBackup {
                version: target_version,
                path: target_dir,
            });
        }
        for path in self.tracked_files() {
            let Some(fname) = path.file_name() else {
                continue;
            };
            let backup = target_dir.join(fname);
            if backup.exists() {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(ConfigError::io("create dir", parent))?;
                }
                fs::copy(&backup, &path).map_err(ConfigError::io("restore", &path))?;
            }
        }
        let hash_hex = self.hash_files(&self.tracked_files());
        self.write_meta(&ConfigMeta {
            version: target_version,
            hash_hex,
            updated_at: chrono::Utc::now().timestamp(),
        })?;
        info!(version = target_version, "configuration rolled back");
        Ok(self.snapshot())
    }
}
