//! Store descriptors.
//!
//! A descriptor names a backend type, an optional connector, and per-type
//! options:
//!
//! ```json
//! { "type": "xun", "option": { "table": "sessions", "persist_interval": 0.5 } }
//! ```
//!
//! Descriptors load from JSON or TOML files; the file stem up to the first
//! `.` is the store name (`cache.json` and `cache.lru.json` both define
//! `cache`).

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::store::DEFAULT_CAPACITY;
use crate::store::layered::{
    DEFAULT_CLEANUP_INTERVAL, DEFAULT_PERSIST_INTERVAL, DEFAULT_TABLE, validate_table_name,
};

/// Connector used by `xun` stores that name none.
pub const DEFAULT_CONNECTOR: &str = "default";

/// Persist intervals below this draw a warning.
const SHORT_PERSIST_SECS: f64 = 0.1;

/// Capacities above this draw a warning.
const LARGE_CAPACITY: usize = 1_000_000;

/// Result of descriptor validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent loading.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Backend selected by a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    /// In-memory LRU.
    Lru,
    /// Layered LRU over a SQL table.
    Xun,
    /// Networked cache.
    Redis,
    /// Document database.
    Mongo,
    /// Embedded key-value file.
    Badger,
}

impl StoreType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Xun => "xun",
            Self::Redis => "redis",
            Self::Mongo => "mongo",
            Self::Badger => "badger",
        }
    }

    /// True for types that must name a loaded connector.
    pub fn requires_connector(self) -> bool {
        matches!(self, Self::Redis | Self::Mongo)
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-type options. Unset fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// `lru`: entry capacity.
    #[serde(default)]
    pub size: Option<usize>,
    /// `xun`: back-tier table.
    #[serde(default)]
    pub table: Option<String>,
    /// `xun`: SQL connector name.
    #[serde(default)]
    pub connector: Option<String>,
    /// `xun`: front-tier capacity.
    #[serde(default)]
    pub cache_size: Option<usize>,
    /// Minutes between expiry sweeps.
    #[serde(default)]
    pub cleanup_interval: Option<f64>,
    /// `xun`: seconds between flushes.
    #[serde(default)]
    pub persist_interval: Option<f64>,
    /// `badger`: database file, relative to the registry root unless absolute.
    #[serde(default)]
    pub path: Option<String>,
}

/// One store descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "type")]
    pub kind: StoreType,
    #[serde(default)]
    pub connector: Option<String>,
    #[serde(default)]
    pub option: StoreOptions,
}

fn seconds(value: f64) -> Option<Duration> {
    (value.is_finite() && value > 0.0)
        .then(|| Duration::try_from_secs_f64(value).ok())
        .flatten()
}

impl Descriptor {
    pub fn new(kind: StoreType) -> Self {
        Self {
            kind,
            connector: None,
            option: StoreOptions::default(),
        }
    }

    /// # Errors
    ///
    /// Returns an error for invalid JSON or missing required fields.
    pub fn from_json(source: &str) -> Result<Self> {
        serde_json::from_str(source).context("Failed to parse JSON descriptor")
    }

    /// # Errors
    ///
    /// Returns an error for invalid TOML or missing required fields.
    pub fn from_toml(source: &str) -> Result<Self> {
        toml::from_str(source).context("Failed to parse TOML descriptor")
    }

    /// Loads a descriptor, choosing the format by extension.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The extension is neither `.json` nor `.toml`
    /// - The content does not parse
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read descriptor: {}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            Some("toml") => Self::from_toml(&content),
            _ => bail!(
                "Unsupported descriptor format: {} (expected .json or .toml)",
                path.display()
            ),
        }
        .with_context(|| format!("Invalid descriptor: {}", path.display()))
    }

    /// LRU capacity (`size`).
    pub fn capacity(&self) -> usize {
        self.option.size.unwrap_or(DEFAULT_CAPACITY)
    }

    /// Layered front-tier capacity (`cache_size`).
    pub fn cache_size(&self) -> usize {
        self.option.cache_size.unwrap_or(DEFAULT_CAPACITY)
    }

    pub fn table(&self) -> &str {
        self.option.table.as_deref().unwrap_or(DEFAULT_TABLE)
    }

    pub fn persist_interval(&self) -> Duration {
        self.option
            .persist_interval
            .and_then(seconds)
            .unwrap_or(DEFAULT_PERSIST_INTERVAL)
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.explicit_cleanup_interval()
            .unwrap_or(DEFAULT_CLEANUP_INTERVAL)
    }

    /// The configured sweep interval, if any.
    pub fn explicit_cleanup_interval(&self) -> Option<Duration> {
        self.option
            .cleanup_interval
            .and_then(|minutes| seconds(minutes * 60.0))
    }

    /// Connector for connector-backed types: the top-level field, then
    /// `option.connector`.
    pub fn connector_name(&self) -> Option<&str> {
        self.connector
            .as_deref()
            .or(self.option.connector.as_deref())
    }

    /// SQL connector of a `xun` store: `option.connector`, then the
    /// top-level field, then [`DEFAULT_CONNECTOR`].
    pub fn sql_connector(&self) -> &str {
        self.option
            .connector
            .as_deref()
            .or(self.connector.as_deref())
            .unwrap_or(DEFAULT_CONNECTOR)
    }

    /// Validate the descriptor.
    ///
    /// Returns a `ValidationResult` containing any non-fatal warnings.
    ///
    /// # Errors
    ///
    /// Returns an error listing every problem found:
    /// - Zero capacities
    /// - Invalid table names
    /// - Non-positive intervals
    /// - Missing connector or path for the types that need one
    pub fn validate(&self) -> Result<ValidationResult> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let opt = &self.option;

        match self.kind {
            StoreType::Lru => {
                check_capacity("size", opt.size, &mut errors, &mut warnings);
                for (field, set) in [
                    ("table", opt.table.is_some()),
                    ("persist_interval", opt.persist_interval.is_some()),
                    ("path", opt.path.is_some()),
                ] {
                    if set {
                        warnings.push(format!("option.{field} is ignored by lru stores"));
                    }
                }
            },
            StoreType::Xun => {
                check_capacity("cache_size", opt.cache_size, &mut errors, &mut warnings);
                if let Some(table) = &opt.table
                    && let Err(e) = validate_table_name(table)
                {
                    errors.push(e.to_string());
                }
                if let Some(secs) = opt.persist_interval {
                    if seconds(secs).is_none() {
                        errors.push(format!(
                            "option.persist_interval must be a positive number of seconds (got: {secs})"
                        ));
                    } else if secs < SHORT_PERSIST_SECS {
                        warnings.push(format!(
                            "option.persist_interval {secs}s is very short\n  \
                             Each flush is one SQL transaction; consider 1s or more"
                        ));
                    }
                }
                if opt.path.is_some() {
                    warnings.push("option.path is ignored by xun stores".to_string());
                }
            },
            StoreType::Redis | StoreType::Mongo => {
                if self.connector_name().is_none_or(str::is_empty) {
                    errors.push(format!(
                        "{} stores require a connector\n  \
                         Set \"connector\" to the name of a loaded connector",
                        self.kind
                    ));
                }
            },
            StoreType::Badger => {
                if opt.path.as_deref().is_none_or(|p| p.trim().is_empty()) {
                    errors.push(
                        "badger stores require option.path\n  \
                         Relative paths resolve against the registry root"
                            .to_string(),
                    );
                }
            },
        }

        if let Some(minutes) = opt.cleanup_interval
            && seconds(minutes * 60.0).is_none()
        {
            errors.push(format!(
                "option.cleanup_interval must be a positive number of minutes (got: {minutes})"
            ));
        }

        if !errors.is_empty() {
            bail!(
                "Descriptor validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }

        Ok(ValidationResult { warnings })
    }
}

fn check_capacity(
    field: &str,
    value: Option<usize>,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    match value {
        Some(0) => errors.push(format!(
            "option.{field} cannot be 0. Set a positive number (default: {DEFAULT_CAPACITY})"
        )),
        Some(n) if n > LARGE_CAPACITY => warnings.push(format!(
            "option.{field} {n} is very high (> {LARGE_CAPACITY})\n  \
             Entries are held in memory; large capacities may exhaust it"
        )),
        _ => {},
    }
}

/// Store name for a descriptor file: the file name up to its first `.`.
pub fn store_name(path: &Path) -> Option<String> {
    let file = path.file_name()?.to_str()?;
    let name = file.split('.').next()?;
    (!name.is_empty()).then(|| name.to_string())
}
