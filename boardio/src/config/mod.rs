//! Configuration properties.
//!
//! Configuration is an immutable set of string key/value pairs assembled from
//! layered sources. Builders for providers, platforms and I/O handles consume
//! these properties and materialise typed, validated fields from them.
//!
//! # Sources
//!
//! [`PropertiesLoader::standard`] layers the following sources, lowest to
//! highest precedence. Later sources override earlier ones by key.
//!
//! 1. Environment variables whose name starts with `pi4j.`
//! 2. `/etc/pi4j/pi4j.properties`
//! 3. `~/.pi4j.properties`
//! 4. `{cwd}/pi4j.properties`
//! 5. A bundled resource supplied with [`PropertiesLoader::with_resource`]
//! 6. Explicit overrides supplied with [`PropertiesLoader::with_override`]
//!
//! The `pi4j.` prefix is stripped from every key that carries it, so
//! `pi4j.i2c.bus=1` and `i2c.bus=1` name the same property.

pub mod io;
pub mod serial;

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

pub use io::{
    AnalogInputConfig, AnalogOutputConfig, BaseConfig, ConfigBuilder, DigitalInputConfig,
    DigitalOutputConfig, FromProperties, I2cConfig, IoConfig, PwmConfig, SerialConfig, SpiConfig,
};

/// Key namespace shared by every configuration source.
pub const PROPERTY_PREFIX: &str = "pi4j.";

/// Immutable set of configuration properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    map: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Value of a key that must be present.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::MissingKey(key.to_string()))
    }

    /// Parse an optional value.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(value) => parse_value(key, value).map(Some),
            None => Ok(None),
        }
    }

    /// Parse a value that must be present.
    pub fn require_parsed<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        parse_value(key, self.require(key)?)
    }

    /// Parse an optional integer, accepting decimal or `0x` hexadecimal.
    pub fn integer(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            Some(value) => parse_integer(value)
                .map(Some)
                .ok_or_else(|| Error::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: "not an integer".to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Parse a required integer, accepting decimal or `0x` hexadecimal.
    pub fn require_integer(&self, key: &str) -> Result<i64> {
        self.integer(key)?
            .ok_or_else(|| Error::MissingKey(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The subset of properties under `prefix`, with the prefix removed.
    ///
    /// Fails with [`Error::EmptyProperties`] when this set is empty and with
    /// [`Error::MissingPrefix`] when no key starts with the prefix.
    pub fn with_prefix(&self, prefix: &str) -> Result<Properties> {
        if self.is_empty() {
            return Err(Error::EmptyProperties);
        }
        if prefix.is_empty() {
            return Err(Error::MissingPrefix(String::new()));
        }

        let dotted = if prefix.ends_with('.') {
            prefix.to_string()
        } else {
            format!("{}.", prefix)
        };
        let map: BTreeMap<String, String> = self
            .map
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&dotted).map(|s| (s.to_string(), v.clone())))
            .collect();

        if map.is_empty() {
            return Err(Error::MissingPrefix(prefix.to_string()));
        }
        Ok(Properties { map })
    }

    /// A new set with `other` layered on top of this one.
    pub fn merged(&self, other: &Properties) -> Properties {
        let mut map = self.map.clone();
        map.extend(other.map.iter().map(|(k, v)| (k.clone(), v.clone())));
        Properties { map }
    }
}

impl<K, V> FromIterator<(K, V)> for Properties
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            map: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| Error::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a decimal or `0x`-prefixed hexadecimal integer.
pub fn parse_integer(value: &str) -> Option<i64> {
    let value = value.trim();
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let magnitude = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if negative { -magnitude } else { magnitude })
}

// ---------------------------------------------------------------------------
// Layered loading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Source {
    Environment,
    File { path: PathBuf, required: bool },
    Resource(String),
    Overrides(Vec<(String, String)>),
}

/// Assembles [`Properties`] from layered sources.
#[derive(Debug, Clone, Default)]
pub struct PropertiesLoader {
    sources: Vec<Source>,
}

impl PropertiesLoader {
    /// A loader with no sources.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard source stack: environment, system file, user file,
    /// working-directory file.
    pub fn standard() -> Self {
        let mut loader = Self::new()
            .with_environment()
            .with_optional_file("/etc/pi4j/pi4j.properties");
        if let Some(home) = env::var_os("HOME") {
            loader = loader.with_optional_file(Path::new(&home).join(".pi4j.properties"));
        }
        if let Ok(cwd) = env::current_dir() {
            loader = loader.with_optional_file(cwd.join("pi4j.properties"));
        }
        loader
    }

    pub fn with_environment(mut self) -> Self {
        self.sources.push(Source::Environment);
        self
    }

    /// Layer a file that is skipped when it does not exist.
    pub fn with_optional_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(Source::File {
            path: path.into(),
            required: false,
        });
        self
    }

    /// Layer a file that must exist.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(Source::File {
            path: path.into(),
            required: true,
        });
        self
    }

    /// Layer the contents of a bundled `.properties` resource.
    pub fn with_resource(mut self, contents: impl Into<String>) -> Self {
        self.sources.push(Source::Resource(contents.into()));
        self
    }

    /// Layer a single explicit override; consecutive overrides share a layer.
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let pair = (key.into(), value.into());
        match self.sources.last_mut() {
            Some(Source::Overrides(pairs)) => pairs.push(pair),
            _ => self.sources.push(Source::Overrides(vec![pair])),
        }
        self
    }

    /// Read every source and merge them in order.
    pub fn load(&self) -> Result<Properties> {
        let mut map = BTreeMap::new();

        for source in &self.sources {
            let pairs = match source {
                Source::Environment => env::vars()
                    .filter(|(k, _)| k.starts_with(PROPERTY_PREFIX))
                    .collect(),
                Source::File { path, required } => match fs::read_to_string(path) {
                    Ok(contents) => {
                        debug!(path = %path.display(), "Loaded properties file");
                        parse_properties(&contents)
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                        trace!(path = %path.display(), "Properties file not present");
                        continue;
                    }
                    Err(e) => return Err(Error::io(path, e)),
                },
                Source::Resource(contents) => parse_properties(contents),
                Source::Overrides(pairs) => pairs.clone(),
            };

            for (key, value) in pairs {
                let key = key
                    .strip_prefix(PROPERTY_PREFIX)
                    .map(str::to_string)
                    .unwrap_or(key);
                map.insert(key, value);
            }
        }

        Ok(Properties { map })
    }
}

/// Parse the contents of a Java-style `.properties` file.
///
/// Supports `=`, `:` and whitespace separators, `#`/`!` comments, trailing
/// backslash line continuations and the common escapes (`\t`, `\n`, `\r`,
/// `\\`, `\uXXXX`).
pub fn parse_properties(contents: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut logical = String::new();

    for raw in contents.lines() {
        let line = raw.trim_start();

        if logical.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with('!'))
        {
            continue;
        }

        if ends_with_continuation(line) {
            logical.push_str(&line[..line.len() - 1]);
            continue;
        }
        logical.push_str(line);

        if let Some(pair) = split_pair(&logical) {
            pairs.push(pair);
        }
        logical.clear();
    }

    if !logical.is_empty() {
        if let Some(pair) = split_pair(&logical) {
            pairs.push(pair);
        }
    }

    pairs
}

// An odd number of trailing backslashes continues the line.
fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

fn split_pair(line: &str) -> Option<(String, String)> {
    let mut key = String::new();
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    key.push(next);
                }
            }
            '=' | ':' => break,
            c if c.is_whitespace() => {
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() {
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Some(&next) = chars.peek() {
                    if next == '=' || next == ':' {
                        chars.next();
                    }
                }
                break;
            }
            c => key.push(c),
        }
    }

    if key.is_empty() {
        return None;
    }

    let rest: String = chars.collect();
    Some((key, unescape(rest.trim_start())))
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{000c}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_parse_properties_file() {
        let contents = "\
# comment
! also a comment
i2c.bus = 1
i2c.device:0x04
name Status LED
multi = first \\
        second
path = C:\\\\temp
unicode = \\u0041BC

";
        let props: Properties = parse_properties(contents).into_iter().collect();

        assert_eq!(props.get("i2c.bus"), Some("1"));
        assert_eq!(props.get("i2c.device"), Some("0x04"));
        assert_eq!(props.get("name"), Some("Status LED"));
        assert_eq!(props.get("multi"), Some("first second"));
        assert_eq!(props.get("path"), Some("C:\\temp"));
        assert_eq!(props.get("unicode"), Some("ABC"));
        assert_eq!(props.len(), 6);
    }

    #[test]
    fn test_typed_accessors() {
        let props: Properties = [("address", "0x11"), ("bus", "1"), ("bad", "one")]
            .into_iter()
            .collect();

        assert_eq!(props.require_integer("address").unwrap(), 0x11);
        assert_eq!(props.require_parsed::<u32>("bus").unwrap(), 1);
        assert_eq!(props.parse::<u32>("missing").unwrap(), None);
        assert!(matches!(
            props.require("missing"),
            Err(Error::MissingKey(key)) if key == "missing"
        ));
        assert!(matches!(
            props.require_parsed::<u32>("bad"),
            Err(Error::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer("42"), Some(42));
        assert_eq!(parse_integer("0x2A"), Some(42));
        assert_eq!(parse_integer(" -0x10 "), Some(-16));
        assert_eq!(parse_integer("0xZZ"), None);
        assert_eq!(parse_integer(""), None);
    }

    #[test]
    fn test_with_prefix() {
        let props: Properties = [("i2c.bus", "1"), ("i2c.device", "4"), ("spi.bus", "0")]
            .into_iter()
            .collect();

        let i2c = props.with_prefix("i2c").unwrap();
        assert_eq!(i2c.get("bus"), Some("1"));
        assert_eq!(i2c.len(), 2);

        assert!(matches!(
            props.with_prefix("serial"),
            Err(Error::MissingPrefix(prefix)) if prefix == "serial"
        ));
        assert!(matches!(
            Properties::new().with_prefix("i2c"),
            Err(Error::EmptyProperties)
        ));
    }

    #[test]
    #[serial]
    fn test_loader_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join("system.properties");
        let user = dir.path().join("user.properties");
        fs::File::create(&system)
            .unwrap()
            .write_all(b"pi4j.a = system\nb = system\nc = system\n")
            .unwrap();
        fs::File::create(&user)
            .unwrap()
            .write_all(b"b = user\nc = user\n")
            .unwrap();

        std::env::set_var("pi4j.a", "env");
        std::env::set_var("pi4j.d", "env");

        let props = PropertiesLoader::new()
            .with_environment()
            .with_optional_file(&system)
            .with_optional_file(dir.path().join("absent.properties"))
            .with_optional_file(&user)
            .with_resource("c = resource\n")
            .with_override("pi4j.e", "override")
            .load()
            .unwrap();

        std::env::remove_var("pi4j.a");
        std::env::remove_var("pi4j.d");

        assert_eq!(props.get("a"), Some("system"));
        assert_eq!(props.get("b"), Some("user"));
        assert_eq!(props.get("c"), Some("resource"));
        assert_eq!(props.get("d"), Some("env"));
        assert_eq!(props.get("e"), Some("override"));
    }

    #[test]
    fn test_required_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let result = PropertiesLoader::new()
            .with_file(dir.path().join("absent.properties"))
            .load();
        assert!(matches!(result, Err(Error::Io { .. })));
    }

    #[test]
    fn test_merged_overrides_by_key() {
        let base: Properties = [("a", "1"), ("b", "1")].into_iter().collect();
        let top: Properties = [("b", "2")].into_iter().collect();
        let merged = base.merged(&top);
        assert_eq!(merged.get("a"), Some("1"));
        assert_eq!(merged.get("b"), Some("2"));
    }
}
