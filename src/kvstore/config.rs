//! Chain Configuration
//!
//! Declarative description of a chain, loaded from YAML or JSON:
//!
//! ```yaml
//! model_id:
//!   project: shop
//!   environment: prod
//!   family: catalog
//!   application: api
//!   name: items
//! elements: [inMemory, redis]
//! ttl: 15m
//! batch_size: 100
//! missing_cache_enabled: true
//! metrics_enabled: true
//! in_memory:
//!   max_size: 5000
//!   items_to_prune: 500
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    InMemorySettings, ModelId, Settings, DEFAULT_BATCH_SIZE, DEFAULT_IN_MEMORY_MAX_SIZE, MAX_TTL,
};
use crate::error::{Error, Result};

/// Serializable chain description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Model identity, also the metric label
    pub model_id: ModelId,
    /// Registered element names, fastest first
    pub elements: Vec<String>,
    /// Entry lifetime as a duration string ("90s", "15m", "1h", "1d");
    /// unset or zero means one hour
    pub ttl: Option<String>,
    /// Keys per batch chunk
    pub batch_size: usize,
    /// Cache negative lookups
    pub missing_cache_enabled: bool,
    /// Record per-tier metrics
    pub metrics_enabled: bool,
    /// In-memory element settings
    pub in_memory: InMemoryConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            model_id: ModelId::default(),
            elements: Vec::new(),
            ttl: None,
            batch_size: DEFAULT_BATCH_SIZE,
            missing_cache_enabled: false,
            metrics_enabled: false,
            in_memory: InMemoryConfig::default(),
        }
    }
}

/// In-memory element configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryConfig {
    /// Maximum entries before pruning
    pub max_size: usize,
    /// Entries removed per prune pass, 0 for a tenth of `max_size`
    pub items_to_prune: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_IN_MEMORY_MAX_SIZE,
            items_to_prune: DEFAULT_IN_MEMORY_MAX_SIZE / 10,
        }
    }
}

impl ChainConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(input: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(input)
            .map_err(|e| Error::Config(format!("invalid chain yaml: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json(input: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.elements.is_empty() {
            return Err(Error::Config(format!(
                "kvstore chain {} needs at least one element",
                self.model_id.name
            )));
        }

        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }

        if self.in_memory.max_size == 0 {
            return Err(Error::Config("in_memory.max_size must be at least 1".to_string()));
        }

        let ttl = self.ttl()?;
        if ttl > MAX_TTL {
            return Err(Error::Config(format!(
                "ttl {:?} exceeds the maximum of {:?}",
                ttl, MAX_TTL
            )));
        }

        Ok(())
    }

    /// Parsed TTL, zero when unset
    pub fn ttl(&self) -> Result<Duration> {
        match self.ttl.as_deref() {
            None => Ok(Duration::ZERO),
            Some(ttl) => parse_duration(ttl),
        }
    }

    /// Runtime settings for the chain and its elements
    pub fn settings(&self) -> Result<Settings> {
        Ok(Settings {
            model_id: self.model_id.clone(),
            ttl: self.ttl()?,
            batch_size: self.batch_size.max(1),
            missing_cache_enabled: self.missing_cache_enabled,
            metrics_enabled: self.metrics_enabled,
            in_memory: InMemorySettings {
                max_size: self.in_memory.max_size,
                items_to_prune: self.in_memory.items_to_prune,
            },
        })
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a Go-style duration string such as "1h30m", "90s" or "250ms".
///
/// Units are `ms`, `s`, `m`, `h` and `d`; a trailing bare number counts as
/// seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let part = match c.to_ascii_lowercase() {
            'm' if chars.peek().map(|n| n.eq_ignore_ascii_case(&'s')) == Some(true) => {
                chars.next();
                Duration::from_millis(num)
            }
            'h' => Duration::from_secs(num.saturating_mul(3600)),
            'm' => Duration::from_secs(num.saturating_mul(60)),
            's' => Duration::from_secs(num),
            'd' => Duration::from_secs(num.saturating_mul(86400)),
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total = total
            .checked_add(part)
            .ok_or_else(|| Error::DurationParse(format!("duration out of range: {}", s)))?;
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total = total
            .checked_add(Duration::from_secs(num))
            .ok_or_else(|| Error::DurationParse(format!("duration out of range: {}", s)))?;
    }

    Ok(total)
}

// =============================================================================
// Tests
// =============================================================================
