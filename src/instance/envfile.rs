//! Line-preserving `KEY=VALUE` environment file handling.
//!
//! Re-materializing an existing instance must not clobber values the
//! operator added by hand, so the file is edited line-by-line: managed keys
//! are updated in place, unknown keys, comments and ordering survive.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct EnvFile {
    lines: Vec<Line>,
}

#[derive(Debug, Clone)]
enum Line {
    /// A `KEY=VALUE` pair.
    Pair { key: String, value: String },
    /// A comment or blank line, kept verbatim.
    Raw(String),
}

impl EnvFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read env file {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let lines = content
            .lines()
            .map(|line| {
                let trimmed = line.trim_start();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    return Line::Raw(line.to_string());
                }
                match line.split_once('=') {
                    Some((key, value)) => Line::Pair {
                        key: key.trim().to_string(),
                        value: value.to_string(),
                    },
                    None => Line::Raw(line.to_string()),
                }
            })
            .collect();
        Self { lines }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().rev().find_map(|line| match line {
            Line::Pair { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Set a key, updating the existing line in place or appending. On a
    /// file with duplicate keys the last occurrence is updated, since that
    /// is the one `get` and env-file consumers honor.
    pub fn set(&mut self, key: &str, value: &str) {
        for line in self.lines.iter_mut().rev() {
            if let Line::Pair { key: k, value: v } = line {
                if k == key {
                    *v = value.to_string();
                    return;
                }
            }
        }
        self.lines.push(Line::Pair {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// All key/value pairs (last occurrence wins for duplicates).
    pub fn pairs(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for line in &self.lines {
            if let Line::Pair { key, value } = line {
                map.insert(key.clone(), value.clone());
            }
        }
        map
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Pair { key, value } => {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(value);
                }
                Line::Raw(raw) => out.push_str(raw),
            }
            out.push('\n');
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render())
            .with_context(|| format!("failed to write env file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_get() {
        let env = EnvFile::parse("# header\nBOT_SLUG=alpha\nDB_NAME=bot_alpha\n");
        assert_eq!(env.get("BOT_SLUG"), Some("alpha"));
        assert_eq!(env.get("DB_NAME"), Some("bot_alpha"));
        assert_eq!(env.get("MISSING"), None);
    }

    #[test]
    fn set_updates_in_place() {
        let mut env = EnvFile::parse("A=1\nB=2\n");
        env.set("A", "9");
        assert_eq!(env.render(), "A=9\nB=2\n");
    }

    #[test]
    fn set_on_duplicate_key_updates_the_effective_line() {
        let mut env = EnvFile::parse("A=1\nB=2\nA=3\n");
        env.set("A", "9");
        // The last occurrence wins on read, so that is the line rewritten.
        assert_eq!(env.render(), "A=1\nB=2\nA=9\n");
        assert_eq!(env.get("A"), Some("9"));
    }

    #[test]
    fn set_appends_new_key() {
        let mut env = EnvFile::parse("A=1\n");
        env.set("C", "3");
        assert_eq!(env.render(), "A=1\nC=3\n");
    }

    #[test]
    fn comments_and_blank_lines_survive_edits() {
        let original = "# managed by botfleet\n\nBOT_SLUG=alpha\n# operator note\nWEBHOOK_URL=https://example.com/hook\n";
        let mut env = EnvFile::parse(original);
        env.set("BOT_SLUG", "alpha");
        env.set("DB_PASSWORD", "s3cret");
        let rendered = env.render();
        assert!(rendered.starts_with("# managed by botfleet\n\n"));
        assert!(rendered.contains("# operator note\n"));
        assert!(rendered.contains("WEBHOOK_URL=https://example.com/hook\n"));
        assert!(rendered.ends_with("DB_PASSWORD=s3cret\n"));
    }

    #[test]
    fn value_may_contain_equals() {
        let env = EnvFile::parse("URL=postgres://u:p@h/db?a=b\n");
        assert_eq!(env.get("URL"), Some("postgres://u:p@h/db?a=b"));
    }

    #[test]
    fn round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.env");
        let mut env = EnvFile::new();
        env.set("BOT_SLUG", "alpha");
        env.write(&path).unwrap();

        let loaded = EnvFile::load(&path).unwrap();
        assert_eq!(loaded.get("BOT_SLUG"), Some("alpha"));
    }
}
