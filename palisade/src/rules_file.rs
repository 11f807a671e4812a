use anyhow::{Context, Result};
use palisade_core::Rule;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;
use utils::enforce_writable;

/// Non-blank, non-comment lines of a rules file. A missing file is empty.
pub fn read_rule_lines(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("open rules {}", path.display()))?;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read rules {}", path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        lines.push(trimmed.to_string());
    }
    Ok(lines)
}

pub fn parse_rules(lines: &[String]) -> Result<Vec<Rule>> {
    lines
        .iter()
        .enumerate()
        .map(|(idx, line)| {
            line.parse::<Rule>()
                .with_context(|| format!("rule {} ({line:?})", idx + 1))
        })
        .collect()
}

pub fn load_rules(path: &Path) -> Result<Vec<Rule>> {
    parse_rules(&read_rule_lines(path)?)
}

pub fn write_rules(path: &Path, rules: &[Rule]) -> Result<()> {
    enforce_writable(path)?;
    let mut body = String::new();
    for rule in rules {
        body.push_str(&rule.to_string());
        body.push('\n');
    }
    fs::write(path, body).with_context(|| format!("write rules {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::{Action, PortMatch};
    use tempfile::tempdir;

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("firewall.rules");
        fs::write(
            &path,
            "# outbound web\nhttp_out out 10.1.1.0/24 any TCP >1023 80 any accept\n\n  \n\
             default any any any any any any any drop\n",
        )
        .unwrap();
        let rules = load_rules(&path).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "http_out");
        assert_eq!(rules[0].dst_port, PortMatch::Exact(80));
        assert_eq!(rules[1].action, Action::Drop);
    }

    #[test]
    fn missing_file_has_no_rules() {
        let dir = tempdir().unwrap();
        assert!(load_rules(&dir.path().join("absent.rules")).unwrap().is_empty());
    }

    #[test]
    fn bad_line_reports_its_position() {
        let lines = vec![
            "ok any any any any any any any accept".to_string(),
            "broken any any".to_string(),
        ];
        let err = parse_rules(&lines).unwrap_err();
        assert!(format!("{err:#}").contains("rule 2"));
    }

    #[test]
    fn written_rules_load_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("firewall.rules");
        let rules = parse_rules(&["ssh in any 10.1.1.0/24 tcp any 22 any accept".to_string()]).unwrap();
        write_rules(&path, &rules).unwrap();
        assert_eq!(load_rules(&path).unwrap(), rules);
    }
}
