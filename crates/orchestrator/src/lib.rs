//! Wires the aggregation mapper, downstream registry, response cache and
//! upstream manager into the public surface consumed by the gRPC transport
//! shim (spec component C6).

mod metrics;
mod router;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_aggregation::AggregationRules;
use relay_cache::{CacheConfig, FetchResult, ResponseCache};
use relay_core::key::AggregatedKey;
use relay_core::ErrorKind;
use relay_registry::{DownstreamRegistry, WatchId};
use relay_xds::{Metrics as XdsMetrics, OriginRoute, Request, Response, UpstreamManager, UpstreamManagerConfig};
use prometheus_client::registry::Registry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

pub use metrics::RelayMetrics;
pub use relay_registry::Delivery;
pub use router::ResponseRouter;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
	pub cache: CacheConfig,
	pub upstream: UpstreamManagerConfig,
	pub sweep_interval: Duration,
	pub channel_capacity: usize,
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		OrchestratorConfig {
			cache: CacheConfig::default(),
			upstream: UpstreamManagerConfig::default(),
			sweep_interval: Duration::from_secs(10),
			channel_capacity: 16,
		}
	}
}

pub struct Orchestrator {
	rules: AggregationRules,
	registry: Arc<DownstreamRegistry>,
	cache: Arc<ResponseCache>,
	upstream: Arc<UpstreamManager>,
	metrics: Arc<RelayMetrics>,
	shutdown: CancellationToken,
}

impl Orchestrator {
	pub fn new(rules_path: &Path, origins: Vec<OriginRoute>, config: OrchestratorConfig, metrics_registry: &mut Registry) -> anyhow::Result<Self> {
		let rules = AggregationRules::load(rules_path)?;
		let registry = Arc::new(DownstreamRegistry::new(config.channel_capacity));
		let cache = Arc::new(ResponseCache::new(config.cache));
		let metrics = Arc::new(RelayMetrics::new(metrics_registry));
		let router = Arc::new(ResponseRouter::new(cache.clone(), registry.clone(), metrics.clone()));
		let xds_metrics = XdsMetrics::new(metrics_registry);
		let upstream = Arc::new(UpstreamManager::new(origins, config.upstream, xds_metrics, router));
		Ok(Orchestrator { rules, registry, cache, upstream, metrics, shutdown: CancellationToken::new() })
	}

	/// Runs the background sweep loop until `shutdown` is requested. Intended
	/// to be spawned once as its own task.
	pub async fn run(&self, sweep_interval: Duration) {
		let mut ticker = tokio::time::interval(sweep_interval);
		loop {
			tokio::select! {
				_ = self.shutdown.cancelled() => return,
				_ = ticker.tick() => self.sweep().await,
			}
		}
	}

	pub fn shutdown(&self) {
		self.shutdown.cancel();
	}

	async fn sweep(&self) {
		let evicted = self.cache.sweep(Instant::now());
		self.metrics.record_cache_eviction(evicted.len() as u64);
		for key in evicted {
			info!(%key, "evicting idle cache entry");
			self.upstream.close(&key).await;
		}
	}

	fn key_for(&self, request: &Request) -> Result<AggregatedKey, ErrorKind> {
		relay_aggregation::key(&self.rules, request).inspect_err(|_| self.metrics.record_no_rule_match())
	}

	/// Closes one cache entry (or every entry, if `key` is `None`), tells
	/// every watch that was bound to it `ErrorKind::CacheCleared`, and closes
	/// the upstream subscription(s) it was feeding. Returns the number of
	/// entries cleared.
	pub fn clear_cache(&self, key: Option<&AggregatedKey>) -> usize {
		let cleared = self.cache.clear(key);
		let count = cleared.len();
		for (cleared_key, watches, upstream) in cleared {
			for watch_id in watches {
				if let Some(watch) = self.registry.get_by_id(watch_id) {
					watch.close(ErrorKind::CacheCleared);
				}
				self.registry.delete_by_id(watch_id);
				self.metrics.record_watch_closed(&ErrorKind::CacheCleared);
			}
			if let Some(handle) = upstream {
				handle.close();
			}
			debug!(key = %cleared_key, "cache entry cleared via admin");
		}
		count
	}

	/// Registers a watch for `request`, binding it to its aggregated key's
	/// cache entry and ensuring an upstream subscription exists for that key.
	/// If the entry already holds a response the request hasn't already
	/// acked, the new watch is delivered it immediately.
	#[instrument(skip_all)]
	pub async fn create_watch(&self, request: Request) -> Result<(WatchId, mpsc::Receiver<Delivery>, CancelHandle), ErrorKind> {
		let key = self.key_for(&request)?;
		let (watch, rx) = self.registry.create(request.clone());
		let now = Instant::now();
		self.cache.add_watch(&key, watch.id(), now);

		let fetched = self.cache.fetch(&key, now);
		self.metrics.record_cache_result(match &fetched {
			FetchResult::Fresh(_) => "hit",
			FetchResult::Stale(_) => "stale",
			FetchResult::Error(_) => "error",
			FetchResult::Miss => "miss",
		});
		if let FetchResult::Fresh(resp) | FetchResult::Stale(resp) = &fetched {
			// A plain ACK of the version/nonce already cached needs no
			// resend — every inbound downstream message (including ACKs)
			// tears down and recreates its watch, so without this check a
			// client would be resent the same response forever. A NACK
			// (or any request whose acked state predates the cache's
			// current one) is always redelivered.
			let in_sync = !request.nacked
				&& request.last_acked_version.as_deref() == Some(&*resp.version_info)
				&& request.last_acked_nonce.as_deref() == Some(&*resp.nonce);
			if !in_sync {
				let _ = watch.deliver(resp.clone());
			}
		}

		let seed = self.lowest_acked_seed(&key, request);
		let handle = self.upstream.open_or_join(key.clone(), seed).await?;
		self.cache.set_upstream(&key, handle, now);

		let cancel = CancelHandle {
			key,
			watch_id: watch.id(),
			registry: self.registry.clone(),
			cache: self.cache.clone(),
			upstream: self.upstream.clone(),
		};
		Ok((watch.id(), rx, cancel))
	}

	/// Computes the request the upstream manager should (re)send for `key`:
	/// the caller's own request if no subscription exists yet, otherwise
	/// whichever of the caller's or the currently-bound watches' requests
	/// acknowledges the lowest version (spec's request-coalescing rule).
	fn lowest_acked_seed(&self, key: &AggregatedKey, candidate: Request) -> Request {
		let mut lowest = candidate;
		for watch_id in self.cache.bound_watches(key) {
			if let Some(watch) = self.registry.get_by_id(watch_id) {
				let other = watch.request();
				if !lowest.acked_no_later_than(other) {
					lowest = other.clone();
				}
			}
		}
		lowest
	}

	/// Synchronous cache lookup with no watch registration and no upstream
	/// side effects: `Ok(Some(_))` on a fresh or stale-but-servable hit,
	/// `Ok(None)` on a miss, `Err` only if no aggregation rule matches.
	pub fn fetch(&self, request: &Request) -> Result<Option<Arc<Response>>, ErrorKind> {
		let key = self.key_for(request)?;
		match self.cache.fetch(&key, Instant::now()) {
			FetchResult::Fresh(resp) | FetchResult::Stale(resp) => Ok(Some(resp)),
			FetchResult::Error(err) => Err(err),
			FetchResult::Miss => Ok(None),
		}
	}

	pub fn registry(&self) -> &Arc<DownstreamRegistry> {
		&self.registry
	}

	pub fn cache(&self) -> &Arc<ResponseCache> {
		&self.cache
	}
}

/// Returned by `create_watch`. Invoking `cancel` atomically tombstones the
/// watch, unbinds it from the cache entry, and — if that was the entry's
/// last bound watch — starts draining the upstream subscription.
pub struct CancelHandle {
	key: AggregatedKey,
	watch_id: WatchId,
	registry: Arc<DownstreamRegistry>,
	cache: Arc<ResponseCache>,
	upstream: Arc<UpstreamManager>,
}

impl CancelHandle {
	#[instrument(skip_all, fields(key = %self.key, watch = %self.watch_id))]
	pub async fn cancel(self) {
		self.registry.delete_by_id(self.watch_id);
		let now_idle = self.cache.remove_watch(&self.key, self.watch_id);
		if now_idle {
			if let Some(handle) = self.cache.upstream_of(&self.key) {
				handle.start_drain();
			} else {
				self.upstream.close(&self.key).await;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use relay_xds::{NodeIdentity, Response, XdsVariant};

	use super::*;

	fn write_rules(dir: &tempfile::TempDir) -> std::path::PathBuf {
		let path = dir.path().join("rules.yaml");
		std::fs::write(
			&path,
			r#"
schema_version: 1
matchers:
  - predicate:
      type_url: "type.googleapis.com/envoy.config.cluster.v3.Cluster"
    key_template: "<type>"
"#,
		)
		.unwrap();
		path
	}

	fn test_orchestrator(dir: &tempfile::TempDir) -> Orchestrator {
		let rules_path = write_rules(dir);
		let origins = vec![OriginRoute { key_pattern: "*".to_string(), address: "http://127.0.0.1:1".to_string() }];
		let mut registry = Registry::default();
		Orchestrator::new(&rules_path, origins, OrchestratorConfig::default(), &mut registry).unwrap()
	}

	fn req(version: Option<&str>, nonce: Option<&str>, nacked: bool) -> Request {
		Request {
			type_url: relay_core::strng::new("type.googleapis.com/envoy.config.cluster.v3.Cluster"),
			resource_names: BTreeSet::new(),
			node: NodeIdentity::default(),
			last_acked_version: version.map(relay_core::strng::new),
			last_acked_nonce: nonce.map(relay_core::strng::new),
			nacked,
			variant: XdsVariant::V3,
		}
	}

	fn response(version: &str, nonce: &str) -> Arc<Response> {
		Arc::new(Response {
			type_url: relay_core::strng::new("type.googleapis.com/envoy.config.cluster.v3.Cluster"),
			version_info: relay_core::strng::new(version),
			nonce: relay_core::strng::new(nonce),
			resources: vec![],
		})
	}

	#[tokio::test]
	async fn no_rule_match_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let orchestrator = test_orchestrator(&dir);
		let mut bad = req(None, None, false);
		bad.type_url = relay_core::strng::new("type.googleapis.com/envoy.config.listener.v3.Listener");
		let err = orchestrator.create_watch(bad).await.unwrap_err();
		assert_eq!(err, ErrorKind::NoAggregationRule);
	}

	#[tokio::test]
	async fn fresh_watch_with_no_cache_entry_gets_no_immediate_delivery() {
		let dir = tempfile::tempdir().unwrap();
		let orchestrator = test_orchestrator(&dir);
		let (_id, mut rx, _cancel) = orchestrator.create_watch(req(None, None, false)).await.unwrap();
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn redelivers_cached_response_to_a_fresh_subscriber() {
		let dir = tempfile::tempdir().unwrap();
		let orchestrator = test_orchestrator(&dir);
		let key = AggregatedKey::new("type.googleapis.com/envoy.config.cluster.v3.Cluster");
		orchestrator.cache().set_response(&key, response("1", "n1"), Instant::now());

		let (_id, mut rx, _cancel) = orchestrator.create_watch(req(None, None, false)).await.unwrap();
		let delivery = rx.try_recv().expect("a fresh subscriber should be sent the already-cached response");
		assert!(matches!(delivery, Delivery::Response(_)));
	}

	#[tokio::test]
	async fn does_not_redeliver_a_response_the_request_already_acked() {
		let dir = tempfile::tempdir().unwrap();
		let orchestrator = test_orchestrator(&dir);
		let key = AggregatedKey::new("type.googleapis.com/envoy.config.cluster.v3.Cluster");
		orchestrator.cache().set_response(&key, response("1", "n1"), Instant::now());

		let (_id, mut rx, _cancel) = orchestrator.create_watch(req(Some("1"), Some("n1"), false)).await.unwrap();
		assert!(rx.try_recv().is_err(), "an ACK of the already-cached version/nonce must not be resent");
	}

	#[tokio::test]
	async fn a_nack_of_the_current_version_is_still_redelivered() {
		let dir = tempfile::tempdir().unwrap();
		let orchestrator = test_orchestrator(&dir);
		let key = AggregatedKey::new("type.googleapis.com/envoy.config.cluster.v3.Cluster");
		orchestrator.cache().set_response(&key, response("1", "n1"), Instant::now());

		let (_id, mut rx, _cancel) = orchestrator.create_watch(req(Some("1"), Some("n1"), true)).await.unwrap();
		assert!(rx.try_recv().is_ok(), "a NACK must be resent the cached response even though its acked fields match");
	}

	#[tokio::test]
	async fn two_watches_on_the_same_key_share_one_cache_entry() {
		let dir = tempfile::tempdir().unwrap();
		let orchestrator = test_orchestrator(&dir);
		let key = AggregatedKey::new("type.googleapis.com/envoy.config.cluster.v3.Cluster");
		let (_id1, _rx1, _cancel1) = orchestrator.create_watch(req(None, None, false)).await.unwrap();
		let mut second = req(None, None, false);
		second.resource_names = BTreeSet::from([relay_core::strng::new("some-cluster")]);
		let (_id2, _rx2, _cancel2) = orchestrator.create_watch(second).await.unwrap();
		assert_eq!(orchestrator.cache().watch_count(&key), 2);
	}

	#[tokio::test]
	async fn cancelling_the_last_watch_starts_draining_the_upstream_subscription() {
		let dir = tempfile::tempdir().unwrap();
		let orchestrator = test_orchestrator(&dir);
		let key = AggregatedKey::new("type.googleapis.com/envoy.config.cluster.v3.Cluster");
		let (_id, _rx, cancel) = orchestrator.create_watch(req(None, None, false)).await.unwrap();
		cancel.cancel().await;
		assert_eq!(orchestrator.cache().watch_count(&key), 0);
	}

	#[tokio::test]
	async fn clear_cache_closes_bound_watches_with_cache_cleared() {
		let dir = tempfile::tempdir().unwrap();
		let orchestrator = test_orchestrator(&dir);
		let key = AggregatedKey::new("type.googleapis.com/envoy.config.cluster.v3.Cluster");
		let (_id, mut rx, _cancel) = orchestrator.create_watch(req(None, None, false)).await.unwrap();

		let cleared = orchestrator.clear_cache(Some(&key));
		assert_eq!(cleared, 1);
		let delivery = rx.recv().await.expect("the watch should be told its entry was cleared");
		assert!(matches!(delivery, Delivery::Terminal(ErrorKind::CacheCleared)));
	}

	#[tokio::test]
	async fn clear_cache_with_no_key_clears_everything() {
		let dir = tempfile::tempdir().unwrap();
		let orchestrator = test_orchestrator(&dir);
		let _a = orchestrator.create_watch(req(None, None, false)).await.unwrap();
		let mut other = req(None, None, false);
		other.type_url = relay_core::strng::new("type.googleapis.com/envoy.config.cluster.v3.Cluster");
		other.resource_names = BTreeSet::from([relay_core::strng::new("x")]);
		let _b = orchestrator.create_watch(other).await.unwrap();

		assert_eq!(orchestrator.clear_cache(None), 1, "both watches coalesce onto the same aggregated key");
	}

	#[tokio::test]
	async fn fetch_is_a_synchronous_lookup_with_no_watch_side_effects() {
		let dir = tempfile::tempdir().unwrap();
		let orchestrator = test_orchestrator(&dir);
		let key = AggregatedKey::new("type.googleapis.com/envoy.config.cluster.v3.Cluster");
		assert!(orchestrator.fetch(&req(None, None, false)).unwrap().is_none());

		orchestrator.cache().set_response(&key, response("1", "n1"), Instant::now());
		assert!(orchestrator.fetch(&req(None, None, false)).unwrap().is_some());
		assert_eq!(orchestrator.cache().watch_count(&key), 0);
	}
}
