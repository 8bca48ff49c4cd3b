//! Orchestrator-level metrics (spec §6): counters the xds crate's own
//! `Metrics` has no view into, since they're about aggregation and cache
//! outcomes rather than the wire.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use relay_core::ErrorKind;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabel {
	kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CacheResultLabel {
	result: String,
}

/// Cheap to clone (internally `Arc`'d families), mirroring `relay_xds::Metrics`.
#[derive(Clone)]
pub struct RelayMetrics {
	no_rule_match: Counter,
	watch_closed: Family<ErrorLabel, Counter>,
	subscription_errors: Family<ErrorLabel, Counter>,
	cache_result: Family<CacheResultLabel, Counter>,
	cache_evictions: Counter,
}

impl RelayMetrics {
	pub fn new(registry: &mut Registry) -> Self {
		let no_rule_match = Counter::default();
		let watch_closed = Family::default();
		let subscription_errors = Family::default();
		let cache_result = Family::default();
		let cache_evictions = Counter::default();
		registry.register("no_rule_match", "Requests that matched no aggregation rule", no_rule_match.clone());
		registry.register("watch_closed", "Bound watches closed, by reason", watch_closed.clone());
		registry.register("upstream_subscription_errors", "Upstream subscription errors, by kind", subscription_errors.clone());
		registry.register("cache_result", "Cache lookups by result", cache_result.clone());
		registry.register("cache_evictions", "Cache entries evicted (sweep or over capacity)", cache_evictions.clone());
		RelayMetrics { no_rule_match, watch_closed, subscription_errors, cache_result, cache_evictions }
	}

	pub fn record_no_rule_match(&self) {
		self.no_rule_match.inc();
	}

	pub fn record_watch_closed(&self, kind: &ErrorKind) {
		self.watch_closed.get_or_create(&ErrorLabel { kind: kind.label().to_string() }).inc();
	}

	pub fn record_subscription_error(&self, kind: &ErrorKind) {
		self.subscription_errors.get_or_create(&ErrorLabel { kind: kind.label().to_string() }).inc();
	}

	pub fn record_cache_result(&self, result: &str) {
		self.cache_result.get_or_create(&CacheResultLabel { result: result.to_string() }).inc();
	}

	pub fn record_cache_eviction(&self, n: u64) {
		self.cache_evictions.inc_by(n);
	}
}
