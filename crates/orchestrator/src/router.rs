use std::sync::Arc;
use std::time::Instant;

use relay_cache::ResponseCache;
use relay_core::key::AggregatedKey;
use relay_core::ErrorKind;
use relay_registry::DownstreamRegistry;
use relay_xds::{Response, UpstreamResponseSink};
use tracing::{debug, warn};

use crate::metrics::RelayMetrics;

/// Bridges upstream manager callbacks to the cache and registry without
/// requiring `relay-xds` to depend on either crate directly. Constructed
/// before the upstream manager it is handed to, so it can never be built
/// from a not-yet-existing orchestrator.
pub struct ResponseRouter {
	cache: Arc<ResponseCache>,
	registry: Arc<DownstreamRegistry>,
	metrics: Arc<RelayMetrics>,
}

impl ResponseRouter {
	pub fn new(cache: Arc<ResponseCache>, registry: Arc<DownstreamRegistry>, metrics: Arc<RelayMetrics>) -> Self {
		ResponseRouter { cache, registry, metrics }
	}
}

impl UpstreamResponseSink for ResponseRouter {
	/// Installs the response in the cache, then fans it out to every
	/// currently bound watch. A watch whose delivery fails (full channel or
	/// gone) is unbound here — the cache's "closed watches must be unbound
	/// on next observation" invariant is enforced at this single call site.
	/// If unbinding empties the entry, the upstream subscription is told to
	/// drain immediately rather than waiting for the next sweep, so a watch
	/// that vanished via `SlowConsumer` doesn't leave a zombie subscription
	/// streaming unobserved.
	fn on_response(&self, key: &AggregatedKey, response: Response) {
		let now = Instant::now();
		let response = Arc::new(response);
		self.cache.set_response(key, response.clone(), now);

		for watch_id in self.cache.bound_watches(key) {
			match self.registry.get_by_id(watch_id) {
				Some(watch) => match watch.deliver(response.clone()) {
					Ok(()) => {},
					Err(err) => {
						self.metrics.record_watch_closed(&err);
						if self.cache.remove_watch(key, watch_id) {
							if let Some(handle) = self.cache.upstream_of(key) {
								handle.start_drain();
							}
						}
					},
				},
				None => {
					if self.cache.remove_watch(key, watch_id) {
						if let Some(handle) = self.cache.upstream_of(key) {
							handle.start_drain();
						}
					}
				},
			}
		}

		for (evicted_key, handle) in self.cache.evict_over_capacity(key) {
			self.metrics.record_cache_eviction(1);
			debug!(key = %evicted_key, "cache entry evicted over capacity");
			if let Some(handle) = handle {
				handle.close();
			}
		}
	}

	fn on_subscription_error(&self, key: &AggregatedKey, err: ErrorKind) {
		warn!(%key, %err, "upstream subscription error, marking entry sticky");
		self.metrics.record_subscription_error(&err);
		self.cache.set_error(key, err, Instant::now());
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use relay_cache::{CacheConfig, FetchResult};
	use relay_registry::Delivery;
	use relay_xds::{NodeIdentity, Request, ResourceEntry, XdsVariant};

	use super::*;

	fn req(name: &str) -> Request {
		Request {
			type_url: relay_core::strng::new("type.googleapis.com/envoy.config.cluster.v3.Cluster"),
			resource_names: BTreeSet::from([relay_core::strng::new(name)]),
			node: NodeIdentity::default(),
			last_acked_version: None,
			last_acked_nonce: None,
			nacked: false,
			variant: XdsVariant::V3,
		}
	}

	fn response(version: &str) -> Response {
		Response {
			type_url: relay_core::strng::new("type.googleapis.com/envoy.config.cluster.v3.Cluster"),
			version_info: relay_core::strng::new(version),
			nonce: relay_core::strng::new(format!("n{version}")),
			resources: vec![ResourceEntry {
				name: relay_core::strng::new("a"),
				version: relay_core::strng::new(version),
				body: prost_types::Any::default(),
			}],
		}
	}

	fn router() -> (ResponseRouter, Arc<ResponseCache>, Arc<DownstreamRegistry>) {
		let cache = Arc::new(ResponseCache::new(CacheConfig::default()));
		let registry = Arc::new(DownstreamRegistry::new(16));
		let mut metrics_registry = prometheus_client::registry::Registry::default();
		let metrics = Arc::new(RelayMetrics::new(&mut metrics_registry));
		(ResponseRouter::new(cache.clone(), registry.clone(), metrics), cache, registry)
	}

	#[test]
	fn on_response_caches_and_delivers_to_bound_watches() {
		let (router, cache, registry) = router();
		let key = AggregatedKey::new("k1");
		let (watch, mut rx) = registry.create(req("a"));
		cache.add_watch(&key, watch.id(), Instant::now());

		router.on_response(&key, response("1"));

		assert!(matches!(cache.fetch(&key, Instant::now()), FetchResult::Fresh(_)));
		let delivery = rx.try_recv().expect("bound watch should receive the response");
		assert!(matches!(delivery, Delivery::Response(_)));
	}

	#[test]
	fn on_response_unbinds_a_watch_whose_delivery_channel_is_gone() {
		let (router, cache, registry) = router();
		let key = AggregatedKey::new("k1");
		let (watch, rx) = registry.create(req("a"));
		cache.add_watch(&key, watch.id(), Instant::now());
		drop(rx);

		router.on_response(&key, response("1"));

		assert_eq!(cache.watch_count(&key), 0, "a watch whose receiver is gone must be unbound on next delivery");
	}

	#[test]
	fn on_subscription_error_marks_the_entry_as_a_sticky_error() {
		let (router, cache, _registry) = router();
		let key = AggregatedKey::new("k1");
		router.on_subscription_error(&key, ErrorKind::UpstreamTerminalError("boom".to_string()));
		assert!(matches!(cache.fetch(&key, Instant::now()), FetchResult::Error(ErrorKind::UpstreamTerminalError(_))));
	}
}
