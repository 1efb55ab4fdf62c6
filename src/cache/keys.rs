//! Cache key definitions.
//!
//! Service-level keys look like `prefix:user:<id>:type:<kind>[:<param>:<value>]*`,
//! optimizer keys like `query:<16 hex>`. Lock keys are `lock:<key>`; the local
//! token record for a held lock is `lockval:<key>` and never leaves the process.
//!
//! Integer and boolean params render bare. A text param that would read as one
//! of those is written as `%s<text>`; `%` in any other text is escaped, so the
//! marker cannot appear by accident.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

/// Fixed segment that introduces the subject identifier.
const SUBJECT_SEGMENT: &str = "user";
const KIND_SEGMENT: &str = "type";
const LOCK_PREFIX: &str = "lock:";
const LOCK_RECORD_PREFIX: &str = "lockval:";
const QUERY_PREFIX: &str = "query:";
const TEXT_MARKER: &str = "%s";
/// Hex characters of the digest kept in a query key.
const QUERY_DIGEST_HEX_LEN: usize = 16;

/// Scalar parameter attached to a [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamValue {
    Int(i64),
    Text(String),
    Bool(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) if reads_as_scalar(value) => write!(f, "{TEXT_MARKER}{value}"),
            Self::Text(value) => f.write_str(&escape_component(value)),
            Self::Bool(value) => write!(f, "{value}"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Structured cache address.
///
/// Parameters live in a sorted map, so insertion order never changes the
/// generated string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub prefix: String,
    pub subject_id: u64,
    pub kind: String,
    pub params: BTreeMap<String, ParamValue>,
}

impl CacheKey {
    pub fn new(prefix: impl Into<String>, subject_id: u64, kind: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            subject_id,
            kind: kind.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Render the key as its single deterministic string.
    pub fn generate(&self) -> String {
        let mut key = format!(
            "{}:{SUBJECT_SEGMENT}:{}:{KIND_SEGMENT}:{}",
            escape_component(&self.prefix),
            self.subject_id,
            escape_component(&self.kind),
        );
        for (name, value) in &self.params {
            key.push(':');
            key.push_str(&escape_component(name));
            key.push(':');
            key.push_str(&value.to_string());
        }
        key
    }

    /// Glob pattern matching every key for `subject_id` under `prefix`.
    pub fn subject_pattern(prefix: &str, subject_id: u64) -> String {
        format!(
            "{}:{SUBJECT_SEGMENT}:{subject_id}:*",
            escape_component(prefix)
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.generate())
    }
}

/// Remote key guarding the distributed lock named `key`.
pub fn lock_key(key: &str) -> String {
    format!("{LOCK_PREFIX}{key}")
}

/// Local record holding this process's token for the lock named `key`.
pub fn lock_record_key(key: &str) -> String {
    format!("{LOCK_RECORD_PREFIX}{key}")
}

/// Collapse every run of whitespace into one space and trim the ends.
pub fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cache fingerprint for a query: `query:` plus the first 16 hex characters of
/// SHA-256 over the normalized text and the rendered arguments.
pub fn query_fingerprint(sql: &str, rendered_args: &str) -> String {
    let normalized = normalize_sql(sql);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b"|");
    hasher.update(rendered_args.as_bytes());
    let digest = hasher.finalize();
    let hex = hex::encode(&digest[..QUERY_DIGEST_HEX_LEN / 2]);
    format!("{QUERY_PREFIX}{hex}")
}

fn reads_as_scalar(text: &str) -> bool {
    text == "true" || text == "false" || text.parse::<i64>().is_ok()
}

fn escape_component(raw: &str) -> String {
    if !raw.contains(['%', ':']) {
        return raw.to_string();
    }
    raw.replace('%', "%25").replace(':', "%3A")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_without_params() {
        let key = CacheKey::new("trends", 42, "todo");
        assert_eq!(key.generate(), "trends:user:42:type:todo");
    }

    #[test]
    fn param_insertion_order_is_irrelevant() {
        let first = CacheKey::new("statistics", 7, "article")
            .with_param("days", 30)
            .with_param("scope", "team")
            .with_param("archived", false);
        let second = CacheKey::new("statistics", 7, "article")
            .with_param("archived", false)
            .with_param("scope", "team")
            .with_param("days", 30);

        assert_eq!(first.generate(), second.generate());
        assert_eq!(
            first.generate(),
            "statistics:user:7:type:article:archived:false:days:30:scope:team"
        );
    }

    #[test]
    fn separators_inside_components_do_not_collide() {
        let tricky = CacheKey::new("statistics", 1, "todo").with_param("a", "b:c");
        let plain = CacheKey::new("statistics", 1, "todo")
            .with_param("a", "b")
            .with_param("c", "");
        assert_ne!(tricky.generate(), plain.generate());
        assert_eq!(tricky.generate(), "statistics:user:1:type:todo:a:b%3Ac");
    }

    #[test]
    fn text_params_never_collide_with_scalars() {
        let base = || CacheKey::new("statistics", 1, "todo");

        let int = base().with_param("days", 7).generate();
        let text = base().with_param("days", "7").generate();
        assert_eq!(int, "statistics:user:1:type:todo:days:7");
        assert_eq!(text, "statistics:user:1:type:todo:days:%s7");

        assert_ne!(
            base().with_param("archived", true).generate(),
            base().with_param("archived", "true").generate()
        );
        assert_ne!(
            base().with_param("v", "%s7").generate(),
            base().with_param("v", "7").generate()
        );
        assert_eq!(
            base().with_param("scope", "team").generate(),
            "statistics:user:1:type:todo:scope:team"
        );
    }

    #[test]
    fn subject_pattern_covers_generated_keys() {
        let pattern = CacheKey::subject_pattern("trends", 42);
        assert_eq!(pattern, "trends:user:42:*");
        assert!(
            CacheKey::new("trends", 42, "todo")
                .with_param("days", 7)
                .generate()
                .starts_with(pattern.trim_end_matches('*'))
        );
    }

    #[test]
    fn lock_keys() {
        assert_eq!(lock_key("export:42"), "lock:export:42");
        assert_eq!(lock_record_key("export:42"), "lockval:export:42");
    }

    #[test]
    fn whitespace_is_collapsed_before_hashing() {
        let compact = query_fingerprint("SELECT id FROM todos WHERE user_id = $1", "i:1");
        let sprawling = query_fingerprint(
            "  SELECT id\n\tFROM   todos\n WHERE user_id = $1  ",
            "i:1",
        );
        assert_eq!(compact, sprawling);
        assert!(compact.starts_with("query:"));
        assert_eq!(compact.len(), "query:".len() + 16);
        assert!(compact["query:".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn arguments_change_the_fingerprint() {
        let sql = "SELECT * FROM articles WHERE id = $1";
        assert_ne!(query_fingerprint(sql, "i:1"), query_fingerprint(sql, "i:2"));
    }
}
