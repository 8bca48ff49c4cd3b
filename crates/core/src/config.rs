use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::time::serde_duration;

/// Top-level bootstrap configuration for the relay process. Everything the
/// core orchestration engine needs to construct itself lives here; admin
/// bind address and log level are carried too even though the core treats
/// them as external collaborators, matching the ambient-stack requirement
/// that config loading is never scoped out by a Non-goal.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bootstrap {
	/// Path to the aggregation rules file (see `relay_aggregation::Rules`).
	pub aggregation_rules_path: PathBuf,
	/// Upstream origins, matched against an aggregated key the same way
	/// aggregation rules match a request: first match wins.
	pub origins: Vec<OriginConfig>,
	#[serde(default)]
	pub cache: CacheConfig,
	#[serde(default)]
	pub upstream: UpstreamConfig,
	#[serde(default)]
	pub admin: AdminConfig,
	#[serde(default = "default_log_level")]
	pub log_level: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OriginConfig {
	/// Matches against the aggregated key; `*` matches anything.
	pub key_pattern: String,
	pub address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
	#[serde(with = "serde_duration")]
	pub ttl: Duration,
	#[serde(with = "serde_duration")]
	pub stale_serve_window: Duration,
	pub shard_count: usize,
	pub max_entries: usize,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			ttl: Duration::from_secs(300),
			stale_serve_window: Duration::from_secs(30),
			shard_count: 32,
			max_entries: 100_000,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
	#[serde(with = "serde_duration")]
	pub initial_backoff: Duration,
	#[serde(with = "serde_duration")]
	pub max_backoff: Duration,
	#[serde(with = "serde_duration")]
	pub linger: Duration,
	pub max_concurrent_subscriptions: usize,
	/// Whether a downstream NACK is forwarded upstream verbatim, or absorbed
	/// locally by resending the last known-good cached response (default).
	/// See DESIGN.md for the rationale.
	#[serde(default)]
	pub propagate_nacks: bool,
}

impl Default for UpstreamConfig {
	fn default() -> Self {
		Self {
			initial_backoff: Duration::from_millis(10),
			max_backoff: Duration::from_secs(15),
			linger: Duration::from_secs(5),
			max_concurrent_subscriptions: 4096,
			propagate_nacks: false,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
	pub bind_address: SocketAddr,
}

impl Default for AdminConfig {
	fn default() -> Self {
		Self {
			bind_address: ([127, 0, 0, 1], 9901).into(),
		}
	}
}

fn default_log_level() -> String {
	"info".to_string()
}

impl Bootstrap {
	pub fn load(path: &Path) -> anyhow::Result<Self> {
		let content = fs_err::read_to_string(path)?;
		let parsed: Bootstrap = serde_yaml::from_str(&content)?;
		parsed.validate()?;
		Ok(parsed)
	}

	fn validate(&self) -> anyhow::Result<()> {
		anyhow::ensure!(!self.origins.is_empty(), "bootstrap config has no origins configured");
		anyhow::ensure!(self.cache.shard_count > 0, "cache.shard_count must be > 0");
		anyhow::ensure!(
			matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error"),
			"log_level must be one of debug, info, warn, error"
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_unknown_fields() {
		let yaml = "aggregation_rules_path: rules.yaml\norigins: []\nbogus: true\n";
		assert!(serde_yaml::from_str::<Bootstrap>(yaml).is_err());
	}

	#[test]
	fn rejects_empty_origins() {
		let yaml = "aggregation_rules_path: rules.yaml\norigins: []\n";
		let cfg: Bootstrap = serde_yaml::from_str(yaml).unwrap();
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn loads_minimal_config() {
		let yaml = "aggregation_rules_path: rules.yaml\norigins:\n  - key_pattern: \"*\"\n    address: \"http://localhost:18000\"\n";
		let cfg: Bootstrap = serde_yaml::from_str(yaml).unwrap();
		assert!(cfg.validate().is_ok());
		assert_eq!(cfg.cache.shard_count, 32);
	}
}
