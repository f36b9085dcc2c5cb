//! Cache configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::store::EvictionPolicy;

/// Cache mode: builtin in-memory or proxy to external Redis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
  /// In-memory cache (default)
  #[default]
  Builtin,
  /// External Redis server
  Proxy,
}

impl std::fmt::Display for CacheMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheMode::Builtin => write!(f, "builtin"),
      CacheMode::Proxy => write!(f, "proxy"),
    }
  }
}

impl std::str::FromStr for CacheMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "builtin" | "memory" | "inmemory" => Ok(CacheMode::Builtin),
      "proxy" | "external" | "redis" => Ok(CacheMode::Proxy),
      _ => Err(format!("Unknown cache mode: {}", s)),
    }
  }
}

/// Connection settings for an external Redis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheProxyConfig {
  #[serde(default = "default_host")]
  pub host: String,

  #[serde(default = "default_redis_port")]
  pub port: u16,

  #[serde(default)]
  pub password: Option<String>,

  /// Redis database number
  #[serde(default)]
  pub database: u8,

  #[serde(default)]
  pub tls_enabled: bool,
}

fn default_host() -> String {
  "localhost".to_string()
}

fn default_redis_port() -> u16 {
  6379
}

impl Default for CacheProxyConfig {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_redis_port(),
      password: None,
      database: 0,
      tls_enabled: false,
    }
  }
}

impl CacheProxyConfig {
  /// Generate Redis connection URL
  pub fn connection_url(&self) -> String {
    let scheme = if self.tls_enabled { "rediss" } else { "redis" };
    let auth = match &self.password {
      Some(pwd) if !pwd.is_empty() => format!(":{}@", pwd),
      _ => String::new(),
    };
    format!(
      "{}://{}{}:{}/{}",
      scheme, auth, self.host, self.port, self.database
    )
  }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
  #[serde(default)]
  pub mode: CacheMode,

  /// Maximum memory for the builtin cache (e.g., "256mb", "1gb")
  #[serde(default = "default_max_memory")]
  pub max_memory: String,

  /// Eviction policy when memory limit is reached
  #[serde(default)]
  pub eviction: EvictionPolicy,

  /// TTL of reply metadata hashes in seconds
  #[serde(default = "default_meta_ttl")]
  pub reply_meta_ttl_secs: u64,

  /// TTL of article metadata hashes in seconds
  #[serde(default = "default_meta_ttl")]
  pub article_meta_ttl_secs: u64,

  /// TTL of negative placeholders in seconds
  #[serde(default = "default_placeholder_ttl")]
  pub placeholder_ttl_secs: u64,

  /// Interval of the builtin expiry sweep in seconds
  #[serde(default = "default_sweep_interval")]
  pub sweep_interval_secs: u64,

  /// Used in proxy mode
  #[serde(default)]
  pub proxy: CacheProxyConfig,
}

fn default_max_memory() -> String {
  "256mb".to_string()
}

fn default_meta_ttl() -> u64 {
  3600
}

fn default_placeholder_ttl() -> u64 {
  60
}

fn default_sweep_interval() -> u64 {
  30
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      mode: CacheMode::default(),
      max_memory: default_max_memory(),
      eviction: EvictionPolicy::default(),
      reply_meta_ttl_secs: default_meta_ttl(),
      article_meta_ttl_secs: default_meta_ttl(),
      placeholder_ttl_secs: default_placeholder_ttl(),
      sweep_interval_secs: default_sweep_interval(),
      proxy: CacheProxyConfig::default(),
    }
  }
}

impl CacheConfig {
  /// Parse memory size string (e.g., "256mb", "1gb") to bytes
  pub fn max_memory_bytes(&self) -> usize {
    parse_memory_size(&self.max_memory).unwrap_or(256 * 1024 * 1024)
  }

  pub fn reply_meta_ttl(&self) -> Duration {
    Duration::from_secs(self.reply_meta_ttl_secs)
  }

  pub fn article_meta_ttl(&self) -> Duration {
    Duration::from_secs(self.article_meta_ttl_secs)
  }

  pub fn placeholder_ttl(&self) -> Duration {
    Duration::from_secs(self.placeholder_ttl_secs.max(1))
  }
}

/// Parse a memory size string to bytes
/// Supports: b, kb, mb, gb (case insensitive)
pub fn parse_memory_size(s: &str) -> Option<usize> {
  let s = s.trim().to_lowercase();

  let (digits, multiplier) = if let Some(n) = s.strip_suffix("gb") {
    (n, 1024 * 1024 * 1024)
  } else if let Some(n) = s.strip_suffix("mb") {
    (n, 1024 * 1024)
  } else if let Some(n) = s.strip_suffix("kb") {
    (n, 1024)
  } else if let Some(n) = s.strip_suffix('b') {
    (n, 1)
  } else {
    (s.as_str(), 1)
  };

  digits.trim().parse::<usize>().ok().map(|n| n * multiplier)
}

/// Format bytes as human-readable string
pub fn format_memory_size(bytes: usize) -> String {
  const GB: usize = 1024 * 1024 * 1024;
  const MB: usize = 1024 * 1024;
  const KB: usize = 1024;

  if bytes >= GB {
    format!("{:.1}GB", bytes as f64 / GB as f64)
  } else if bytes >= MB {
    format!("{:.1}MB", bytes as f64 / MB as f64)
  } else if bytes >= KB {
    format!("{:.1}KB", bytes as f64 / KB as f64)
  } else {
    format!("{}B", bytes)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_memory_size() {
    assert_eq!(parse_memory_size("256mb"), Some(256 * 1024 * 1024));
    assert_eq!(parse_memory_size("1gb"), Some(1024 * 1024 * 1024));
    assert_eq!(parse_memory_size("512kb"), Some(512 * 1024));
    assert_eq!(parse_memory_size("1024b"), Some(1024));
    assert_eq!(parse_memory_size("1024"), Some(1024));
    assert_eq!(parse_memory_size("256 MB"), Some(256 * 1024 * 1024));
    assert_eq!(parse_memory_size("invalid"), None);
  }

  #[test]
  fn test_format_memory_size() {
    assert_eq!(format_memory_size(256 * 1024 * 1024), "256.0MB");
    assert_eq!(format_memory_size(500), "500B");
  }

  #[test]
  fn test_connection_url() {
    let mut proxy = CacheProxyConfig::default();
    assert_eq!(proxy.connection_url(), "redis://localhost:6379/0");
    proxy.password = Some("secret".into());
    proxy.tls_enabled = true;
    proxy.database = 2;
    assert_eq!(proxy.connection_url(), "rediss://:secret@localhost:6379/2");
  }

  #[test]
  fn test_placeholder_ttl_never_zero() {
    let config = CacheConfig {
      placeholder_ttl_secs: 0,
      ..Default::default()
    };
    assert_eq!(config.placeholder_ttl(), Duration::from_secs(1));
  }
}
