//! Directive-oriented access to Redis/Sentinel config files
//!
//! A config file is newline-delimited text. Each line is whitespace
//! tokenized and a directive is identified by its leading tokens, e.g.
//! `sentinel monitor` or `requirepass`. Token comparison ignores ASCII case
//! because Redis treats config keywords that way.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Raw config text keyed by file name (`redis.conf`, `sentinel.conf`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigFiles(BTreeMap<String, String>);

impl ConfigFiles {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with_file(mut self, file: &str, text: &str) -> Self {
        self.0.insert(file.to_string(), text.to_string());
        self
    }

    pub fn contains(&self, file: &str) -> bool {
        self.0.contains_key(file)
    }

    pub fn file(&self, file: &str) -> Option<&str> {
        self.0.get(file).map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Remaining tokens of the first line whose leading tokens match `prefix`.
    pub fn values(&self, file: &str, prefix: &str) -> Option<Vec<String>> {
        let text = self.0.get(file)?;
        let prefix: Vec<&str> = prefix.split_whitespace().collect();
        text.lines().find_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            matches_prefix(&tokens, &prefix)
                .then(|| tokens[prefix.len()..].iter().map(|t| t.to_string()).collect())
        })
    }

    /// Single value of a directive. `None` unless exactly one token follows
    /// the prefix on the first matching line.
    pub fn value(&self, file: &str, prefix: &str) -> Option<String> {
        let mut values = self.values(file, prefix)?;
        if values.len() == 1 {
            values.pop()
        } else {
            None
        }
    }

    /// Replace the first line matching `prefix` with `"<prefix> <value>"`, or
    /// append that line when no line matches. Returns true when a line was
    /// replaced. Pre-existing duplicates are left alone.
    pub fn set_value(&mut self, file: &str, prefix: &str, value: &str) -> bool {
        let directive = format!("{} {}", prefix.trim(), value.trim());
        let prefix_tokens: Vec<&str> = prefix.split_whitespace().collect();
        let text = self.0.entry(file.to_string()).or_default();

        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        let position = lines.iter().position(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            matches_prefix(&tokens, &prefix_tokens)
        });

        let replaced = match position {
            Some(index) => {
                lines[index] = directive;
                true
            }
            None => {
                if text.is_empty() {
                    lines.clear();
                    lines.push(directive);
                } else if lines.last().is_some_and(|l| l.is_empty()) {
                    // keep the trailing newline at the end of the file
                    let at = lines.len() - 1;
                    lines.insert(at, directive);
                } else {
                    lines.push(directive);
                }
                false
            }
        };

        *text = lines.join("\n");
        replaced
    }
}

impl From<BTreeMap<String, String>> for ConfigFiles {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

fn matches_prefix(tokens: &[&str], prefix: &[&str]) -> bool {
    !prefix.is_empty()
        && tokens.len() >= prefix.len()
        && tokens
            .iter()
            .zip(prefix)
            .all(|(token, p)| token.eq_ignore_ascii_case(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const REDIS_CONF: &str = "port 6379\nrequirepass hunter2\nsave 900 1\n";

    #[test]
    fn test_value_lookup() {
        let files = ConfigFiles::new().with_file("redis.conf", REDIS_CONF);
        assert_eq!(files.value("redis.conf", "port"), Some("6379".to_string()));
        assert_eq!(
            files.value("redis.conf", "requirepass"),
            Some("hunter2".to_string())
        );
        // two tokens follow the prefix
        assert_eq!(files.value("redis.conf", "save"), None);
        assert_eq!(
            files.values("redis.conf", "save"),
            Some(vec!["900".to_string(), "1".to_string()])
        );
        assert_eq!(files.value("redis.conf", "tls-port"), None);
        assert_eq!(files.value("other.conf", "port"), None);
    }

    #[test]
    fn test_prefix_is_token_based() {
        let files = ConfigFiles::new().with_file("redis.conf", "portable yes\nport 7000");
        assert_eq!(files.value("redis.conf", "port"), Some("7000".to_string()));
    }

    #[test]
    fn test_multi_token_prefix_case_insensitive() {
        let files = ConfigFiles::new().with_file(
            "sentinel.conf",
            "sentinel resolve-hostnames no\nsentinel monitor mymaster 10.0.0.1 6379 2",
        );
        assert_eq!(
            files.values("sentinel.conf", "SENTINEL monitor"),
            Some(vec![
                "mymaster".to_string(),
                "10.0.0.1".to_string(),
                "6379".to_string(),
                "2".to_string()
            ])
        );
    }

    #[test]
    fn test_set_value_appends_then_replaces() {
        let mut files = ConfigFiles::new().with_file("redis.conf", "port 6379\nappendonly yes");

        assert!(!files.set_value("redis.conf", "requirepass", "abc"));
        let after_first = files.file("redis.conf").unwrap().lines().count();
        assert_eq!(after_first, 3);

        assert!(files.set_value("redis.conf", "requirepass", "xyz"));
        let text = files.file("redis.conf").unwrap();
        assert_eq!(text.lines().count(), after_first);
        assert_eq!(files.value("redis.conf", "requirepass"), Some("xyz".to_string()));
        assert!(!text.contains("abc"));
    }

    #[test]
    fn test_set_value_keeps_trailing_newline() {
        let mut files = ConfigFiles::new().with_file("redis.conf", REDIS_CONF);
        files.set_value("redis.conf", "maxmemory", "1gb");
        assert_eq!(
            files.file("redis.conf").unwrap(),
            "port 6379\nrequirepass hunter2\nsave 900 1\nmaxmemory 1gb\n"
        );
    }

    #[test]
    fn test_set_value_replaces_only_first_duplicate() {
        let mut files = ConfigFiles::new().with_file("redis.conf", "port 1\nport 2");
        files.set_value("redis.conf", "port", "3");
        assert_eq!(files.file("redis.conf").unwrap(), "port 3\nport 2");
    }

    #[test]
    fn test_set_value_creates_missing_file() {
        let mut files = ConfigFiles::new();
        files.set_value("sentinel.conf", "sentinel monitor", "m 10.0.0.1 6379 2");
        assert_eq!(
            files.file("sentinel.conf"),
            Some("sentinel monitor m 10.0.0.1 6379 2")
        );
    }

    proptest! {
        #[test]
        fn prop_set_value_never_duplicates(
            lines in proptest::collection::vec("[a-z]{1,8}( [a-z0-9]{1,6}){0,2}", 0..8),
            first in "[a-z0-9]{1,6}",
            second in "[a-z0-9]{1,6}",
        ) {
            let text = lines
                .iter()
                .filter(|l| !l.starts_with("requirepass"))
                .cloned()
                .collect::<Vec<_>>()
                .join("\n");
            let mut files = ConfigFiles::new().with_file("redis.conf", &text);

            files.set_value("redis.conf", "requirepass", &first);
            let count_after_first = files.file("redis.conf").unwrap().split('\n').count();
            files.set_value("redis.conf", "requirepass", &second);
            let after = files.file("redis.conf").unwrap();

            prop_assert_eq!(after.split('\n').count(), count_after_first);
            let directives = after
                .lines()
                .filter(|l| l.split_whitespace().next() == Some("requirepass"))
                .count();
            prop_assert_eq!(directives, 1);
            prop_assert_eq!(files.value("redis.conf", "requirepass"), Some(second.clone()));
        }
    }
}
