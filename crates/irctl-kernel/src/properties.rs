use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};

/// Dotted-key property store read from a `key = value` file.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed reading properties {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("failed parsing properties {}", path.display()))
    }

    /// Lines starting with `#` or `!` are comments. The key ends at the first
    /// `=` or `:`; both sides are trimmed.
    pub fn parse(text: &str) -> Result<Self> {
        let mut values = BTreeMap::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let split = line
                .find(['=', ':'])
                .ok_or_else(|| anyhow!("line {}: expected key = value", index + 1))?;
            let key = line[..split].trim();
            if key.is_empty() {
                return Err(anyhow!("line {}: empty key", index + 1));
            }
            values.insert(key.to_owned(), line[split + 1..].trim().to_owned());
        }
        Ok(Self { values })
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("missing property {key}"))
    }

    pub fn get_str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.values.get(key).map_or(default, String::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Result<i64> {
        self.parse_value(key)
    }

    pub fn get_i64_or(&self, key: &str, default: i64) -> Result<i64> {
        self.parse_or(key, default)
    }

    pub fn get_f64(&self, key: &str) -> Result<f64> {
        self.parse_value(key)
    }

    pub fn get_f64_or(&self, key: &str, default: f64) -> Result<f64> {
        self.parse_or(key, default)
    }

    /// Accepts `true`/`false` in any case.
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        let raw = self.get_str(key)?;
        if raw.eq_ignore_ascii_case("true") {
            Ok(true)
        } else if raw.eq_ignore_ascii_case("false") {
            Ok(false)
        } else {
            Err(anyhow!("property {key}: expected true or false, got {raw:?}"))
        }
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        if self.contains(key) {
            self.get_bool(key)
        } else {
            Ok(default)
        }
    }

    pub fn get_char(&self, key: &str) -> Result<char> {
        let raw = self.get_str(key)?;
        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(anyhow!("property {key}: expected one character, got {raw:?}")),
        }
    }

    pub fn get_char_or(&self, key: &str, default: char) -> Result<char> {
        if self.contains(key) {
            self.get_char(key)
        } else {
            Ok(default)
        }
    }

    fn parse_value<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        let raw = self.get_str(key)?;
        raw.parse()
            .with_context(|| format!("property {key}: cannot parse {raw:?}"))
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        if self.contains(key) {
            self.parse_value(key)
        } else {
            Ok(default)
        }
    }
}
