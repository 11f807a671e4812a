#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_ROOT_ENV: &str = "PALISADE_CONFIG_ROOT";
pub const CONFIG_READONLY_ENV: &str = "PALISADE_CONFIG_READONLY";
const DEFAULT_CONFIG_ROOT: &str = "/etc/palisade";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("canonicalize {path}: {reason}")]
    Canonicalize { path: String, reason: String },

    #[error("invalid path {0}")]
    Invalid(String),

    #[error("path {path} must reside under config root {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("configuration is read-only ({CONFIG_READONLY_ENV}=1)")]
    ReadOnlyConfig,

    #[error("path {0} is read-only")]
    ReadOnlyPath(PathBuf),
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid hex input: {0}")]
pub struct HexError(#[from] hex::FromHexError);

pub fn config_root() -> PathBuf {
    std::env::var(CONFIG_ROOT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_ROOT))
}

/// Resolve a user-supplied path, refusing anything outside `root`.
pub fn resolve_under(root: &Path, path: &str, allow_write: bool) -> Result<PathBuf, PathError> {
    let canonicalize = |p: &Path| {
        p.canonicalize().map_err(|e| PathError::Canonicalize {
            path: p.display().to_string(),
            reason: e.to_string(),
        })
    };
    let root_canon = if root.exists() {
        canonicalize(root)?
    } else {
        root.to_path_buf()
    };
    let p = Path::new(path);
    let abs = if p.exists() {
        canonicalize(p)?
    } else {
        let parent = p.parent().filter(|d| !d.as_os_str().is_empty());
        let base = match parent {
            Some(dir) if dir.exists() => canonicalize(dir)?,
            Some(_) => root_canon.clone(),
            None => std::env::current_dir()
                .map_err(|e| PathError::Canonicalize {
                    path: ".".into(),
                    reason: e.to_string(),
                })?,
        };
        base.join(p.file_name().ok_or_else(|| PathError::Invalid(path.to_string()))?)
    };
    if !abs.starts_with(&root_canon) {
        return Err(PathError::OutsideRoot {
            path: abs,
            root: root_canon,
        });
    }
    if allow_write {
        enforce_writable(&abs)?;
    }
    Ok(abs)
}

pub fn enforce_writable(path: &Path) -> Result<(), PathError> {
    if std::env::var(CONFIG_READONLY_ENV).is_ok_and(|v| v == "1") {
        return Err(PathError::ReadOnlyConfig);
    }
    if let Ok(meta) = std::fs::metadata(path)
        && meta.permissions().readonly()
    {
        return Err(PathError::ReadOnlyPath(path.to_path_buf()));
    }
    Ok(())
}

/// Decode hex, ignoring any whitespace between digits.
pub fn hex_to_bytes(input: &str) -> Result<Vec<u8>, HexError> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(hex::decode(cleaned)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn hex_ignores_whitespace() {
        assert_eq!(hex_to_bytes("45 00\n00 1c").unwrap(), vec![0x45, 0x00, 0x00, 0x1c]);
        assert_eq!(hex_to_bytes("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn hex_rejects_odd_length_and_bad_digits() {
        assert!(hex_to_bytes("abc").is_err());
        assert!(hex_to_bytes("zz").is_err());
    }

    #[test]
    fn paths_inside_root_resolve() {
        let dir = tempdir().unwrap();
        let rules = dir.path().join("firewall.rules");
        fs::write(&rules, "x").unwrap();
        let resolved = resolve_under(dir.path(), rules.to_str().unwrap(), false).unwrap();
        assert_eq!(resolved, rules.canonicalize().unwrap());

        let fresh = dir.path().join("new.rules");
        let resolved = resolve_under(dir.path(), fresh.to_str().unwrap(), false).unwrap();
        assert!(resolved.ends_with("new.rules"));
    }

    #[test]
    fn paths_outside_root_are_refused() {
        let root = tempdir().unwrap();
        let other = tempdir().unwrap();
        let outside = other.path().join("firewall.rules");
        fs::write(&outside, "x").unwrap();
        assert!(matches!(
            resolve_under(root.path(), outside.to_str().unwrap(), false),
            Err(PathError::OutsideRoot { .. })
        ));
    }
}
