//! Profile files for the `sluice` binary
//!
//! A profile is a TOML file with a `[pool]` table (the engine's
//! [`PoolConfig`]) plus `[serve]` and `[ping]` tables for the two commands.
//! Every field has a default, so an empty file is a valid profile. Values can
//! be overridden from the command line with `--set key.path=value`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sluice_core::PoolConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level profile configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub pool: PoolConfig,
    pub serve: ServeConfig,
    pub ping: PingConfig,
}

/// `sluice serve` settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Listen address
    pub address: String,
    /// Stop after this long; run until killed when unset
    #[serde(with = "humantime_serde")]
    pub duration: Option<Duration>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self { address: "127.0.0.1:7878".to_string(), duration: None }
    }
}

/// `sluice ping` settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PingConfig {
    /// Candidate server addresses, tried in order
    pub targets: Vec<String>,
    /// Round trips to measure
    pub count: u32,
    /// Bytes per probe
    pub payload_size: usize,
    /// Pause between probes
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Time allowed for each echo
    #[serde(with = "humantime_serde")]
    pub reply_timeout: Duration,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            count: 5,
            payload_size: 64,
            interval: Duration::from_millis(200),
            reply_timeout: Duration::from_secs(2),
        }
    }
}

impl ProfileConfig {
    /// Load profile from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file_with_overrides(path, &[])
    }

    /// Load profile from TOML file with --set style overrides
    pub fn from_file_with_overrides<P: AsRef<Path>>(path: P, overrides: &[String]) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile: {}", path.display()))?;
        Self::from_toml(&content, overrides).with_context(|| format!("Invalid profile: {}", path.display()))
    }

    /// Parse a profile from TOML text, apply overrides and validate
    pub fn from_toml(content: &str, overrides: &[String]) -> Result<Self> {
        let mut value: toml::Value = toml::from_str(content).context("Failed to parse TOML")?;

        for override_str in overrides {
            let (key, val) = parse_key_value(override_str)?;
            set_toml_path(&mut value, &key, &val)
                .with_context(|| format!("Failed to apply override: {override_str}"))?;
        }

        let config: ProfileConfig = value.try_into().context("Failed to deserialize profile")?;
        config.validate()?;
        Ok(config)
    }

    /// Profile built from defaults and overrides only
    pub fn from_overrides(overrides: &[String]) -> Result<Self> {
        Self::from_toml("", overrides)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;

        self.serve_address()?;
        self.ping_targets()?;
        if self.ping.count == 0 {
            bail!("ping.count must be at least 1");
        }
        if self.ping.payload_size == 0 {
            bail!("ping.payload_size must be at least 1");
        }
        if self.ping.reply_timeout.is_zero() {
            bail!("ping.reply_timeout must be > 0");
        }
        Ok(())
    }

    pub fn serve_address(&self) -> Result<SocketAddr> {
        self.serve
            .address
            .parse()
            .with_context(|| format!("Invalid serve.address '{}'", self.serve.address))
    }

    pub fn ping_targets(&self) -> Result<Vec<SocketAddr>> {
        self.ping
            .targets
            .iter()
            .map(|t| t.parse().with_context(|| format!("Invalid ping target '{t}'")))
            .collect()
    }
}

/// Parse a "key=value" string into (key, value) tuple
fn parse_key_value(override_str: &str) -> Result<(String, String)> {
    match override_str.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => bail!("Invalid override format '{override_str}'. Expected 'key=value'"),
    }
}

/// Set a value in TOML using dot-notation path, creating tables on the way
fn set_toml_path(root: &mut toml::Value, path: &str, value_str: &str) -> Result<()> {
    let keys: Vec<&str> = path.split('.').filter(|k| !k.is_empty()).collect();
    let Some((last, parents)) = keys.split_last() else {
        bail!("Empty path");
    };

    let mut current = root;
    for key in parents {
        let toml::Value::Table(table) = current else {
            bail!("Cannot navigate through non-table value at key '{key}'");
        };
        current = table
            .entry(key.to_string())
            .or_insert_with(|| toml::Value::Table(Default::default()));
    }

    let toml::Value::Table(table) = current else {
        bail!("Cannot set key '{last}' on non-table value");
    };
    table.insert(last.to_string(), parse_value(value_str)?);
    Ok(())
}

/// Parse a string value with type inference
fn parse_value(value_str: &str) -> Result<toml::Value> {
    let trimmed = value_str.trim();

    if trimmed == "true" {
        return Ok(toml::Value::Boolean(true));
    }
    if trimmed == "false" {
        return Ok(toml::Value::Boolean(false));
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Ok(toml::Value::Integer(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        return Ok(toml::Value::Float(float_val));
    }

    // Arrays go through the TOML parser
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        let wrapped = format!("value = {trimmed}");
        if let Ok(toml::Value::Table(mut table)) = toml::from_str::<toml::Value>(&wrapped) {
            if let Some(value) = table.remove("value") {
                return Ok(value);
            }
        }
        bail!("Failed to parse array: {trimmed}");
    }

    let string_val = if trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')))
    {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };
    Ok(toml::Value::String(string_val.to_string()))
}
