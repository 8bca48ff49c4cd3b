//! The response cache (spec component C4): one entry per aggregated key,
//! sharded for concurrent access, holding the latest upstream response, the
//! set of watches bound to it, and the handle of the upstream subscription
//! feeding it.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use relay_core::key::AggregatedKey;
use relay_core::ErrorKind;
use relay_registry::WatchId;
use relay_xds::{Response, SubscriptionHandle};
use tracing::debug;

/// What a cache entry currently holds for its aggregated key.
#[derive(Clone)]
enum EntryPayload {
	Empty,
	Response(Arc<Response>),
	StickyError(ErrorKind),
}

struct CacheEntry {
	payload: EntryPayload,
	version: u64,
	resource_index: HashMap<String, String>,
	expires_at: Instant,
	stale_serve_until: Instant,
	watches: HashSet<WatchId>,
	upstream: Option<SubscriptionHandle>,
	/// Last time this entry was written to. Used only to pick eviction
	/// candidates under `max_entries`; not a true last-access clock.
	last_touched: Instant,
}

impl CacheEntry {
	fn empty(now: Instant) -> Self {
		CacheEntry {
			payload: EntryPayload::Empty,
			version: 0,
			resource_index: HashMap::new(),
			expires_at: now,
			stale_serve_until: now,
			watches: HashSet::new(),
			upstream: None,
			last_touched: now,
		}
	}
}

/// Diff between what the cache held for a key before `set_response` and what
/// it holds now, reported so callers can decide what to push to watches
/// without re-deriving it themselves.
#[derive(Clone, Debug, Default)]
pub struct ResourceDelta {
	pub added_or_updated: Vec<String>,
	pub removed: Vec<String>,
}

pub enum FetchResult {
	Fresh(Arc<Response>),
	/// Past `ttl` but still inside the stale-serve window: served as-is
	/// while a background revalidation (if any) is in flight.
	Stale(Arc<Response>),
	Error(ErrorKind),
	Miss,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
	pub ttl: Duration,
	pub stale_serve_window: Duration,
	pub shard_count: usize,
	/// Total entry cap across all shards. Enforced per-shard (divided evenly)
	/// by evicting the least-recently-touched entries with zero bound
	/// watches first; entries with bound watches are never evicted.
	pub max_entries: usize,
}

impl Default for CacheConfig {
	fn default() -> Self {
		CacheConfig { ttl: Duration::from_secs(300), stale_serve_window: Duration::from_secs(30), shard_count: 32, max_entries: 100_000 }
	}
}

pub struct ResponseCache {
	shards: Vec<RwLock<HashMap<AggregatedKey, CacheEntry>>>,
	config: CacheConfig,
	per_shard_cap: usize,
}

impl ResponseCache {
	pub fn new(config: CacheConfig) -> Self {
		let shard_count = config.shard_count.max(1);
		let per_shard_cap = (config.max_entries / shard_count).max(1);
		let shards = (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect();
		ResponseCache { shards, config, per_shard_cap }
	}

	fn shard_index(&self, key: &AggregatedKey) -> usize {
		let mut hasher = DefaultHasher::new();
		key.hash(&mut hasher);
		(hasher.finish() as usize) % self.shards.len()
	}

	fn shard(&self, key: &AggregatedKey) -> &RwLock<HashMap<AggregatedKey, CacheEntry>> {
		&self.shards[self.shard_index(key)]
	}

	pub fn fetch(&self, key: &AggregatedKey, now: Instant) -> FetchResult {
		let shard = self.shard(key).read();
		match shard.get(key) {
			None => FetchResult::Miss,
			Some(entry) => match &entry.payload {
				EntryPayload::Empty => FetchResult::Miss,
				EntryPayload::StickyError(err) => FetchResult::Error(err.clone()),
				EntryPayload::Response(resp) => {
					if now < entry.expires_at {
						FetchResult::Fresh(resp.clone())
					} else if now < entry.stale_serve_until {
						FetchResult::Stale(resp.clone())
					} else {
						FetchResult::Miss
					}
				},
			},
		}
	}

	/// Installs `response` as the latest payload for `key`, bumping the
	/// version counter and computing the per-resource delta against what was
	/// previously cached (mirrors `ResourceDelta::added_or_updated`/`removed`
	/// in the style of a resource-versioned xDS state cache).
	pub fn set_response(&self, key: &AggregatedKey, response: Arc<Response>, now: Instant) -> ResourceDelta {
		let mut shard = self.shard(key).write();
		let entry = shard.entry(key.clone()).or_insert_with(|| CacheEntry::empty(now));

		let mut new_index = HashMap::new();
		let mut delta = ResourceDelta::default();
		for resource in &response.resources {
			let name = resource.name.to_string();
			let version = resource.version.to_string();
			if entry.resource_index.get(&name) != Some(&version) {
				delta.added_or_updated.push(name.clone());
			}
			new_index.insert(name, version);
		}
		for name in entry.resource_index.keys() {
			if !new_index.contains_key(name) {
				delta.removed.push(name.clone());
			}
		}

		entry.resource_index = new_index;
		entry.payload = EntryPayload::Response(response);
		entry.version += 1;
		entry.expires_at = now + self.config.ttl;
		entry.stale_serve_until = now + self.config.ttl + self.config.stale_serve_window;
		entry.last_touched = now;
		delta
	}

	/// Evicts the least-recently-touched idle (zero bound watches) entries in
	/// `key`'s shard until it is back under the per-shard share of
	/// `max_entries`. Entries with bound watches are never evicted, even if
	/// that leaves the shard over capacity. Returns the evicted keys and
	/// their upstream subscription handles (if any), so the caller can close
	/// those subscriptions instead of leaving them to stream unobserved.
	pub fn evict_over_capacity(&self, key: &AggregatedKey) -> Vec<(AggregatedKey, Option<SubscriptionHandle>)> {
		let mut shard = self.shard(key).write();
		if shard.len() <= self.per_shard_cap {
			return Vec::new();
		}
		let mut idle: Vec<(AggregatedKey, Instant)> =
			shard.iter().filter(|(_, e)| e.watches.is_empty()).map(|(k, e)| (k.clone(), e.last_touched)).collect();
		idle.sort_by_key(|(_, touched)| *touched);

		let mut evicted = Vec::new();
		for (idle_key, _) in idle {
			if shard.len() <= self.per_shard_cap {
				break;
			}
			if let Some(entry) = shard.remove(&idle_key) {
				debug!(key = %idle_key, "evicting cache entry over capacity");
				evicted.push((idle_key, entry.upstream));
			}
		}
		evicted
	}

	pub fn set_error(&self, key: &AggregatedKey, err: ErrorKind, now: Instant) {
		let mut shard = self.shard(key).write();
		let entry = shard.entry(key.clone()).or_insert_with(|| CacheEntry::empty(now));
		entry.payload = EntryPayload::StickyError(err);
	}

	pub fn add_watch(&self, key: &AggregatedKey, watch: WatchId, now: Instant) -> bool {
		let mut shard = self.shard(key).write();
		let entry = shard.entry(key.clone()).or_insert_with(|| CacheEntry::empty(now));
		let first_watch = entry.watches.is_empty();
		entry.watches.insert(watch);
		first_watch
	}

	/// Removes `watch` from `key`'s bound set. Returns `true` if the entry
	/// now has no bound watches (the orchestrator should start draining the
	/// associated upstream subscription).
	pub fn remove_watch(&self, key: &AggregatedKey, watch: WatchId) -> bool {
		let mut shard = self.shard(key).write();
		let Some(entry) = shard.get_mut(key) else { return false };
		entry.watches.remove(&watch);
		entry.watches.is_empty()
	}

	pub fn set_upstream(&self, key: &AggregatedKey, handle: SubscriptionHandle, now: Instant) {
		let mut shard = self.shard(key).write();
		let entry = shard.entry(key.clone()).or_insert_with(|| CacheEntry::empty(now));
		entry.upstream = Some(handle);
	}

	pub fn upstream_of(&self, key: &AggregatedKey) -> Option<SubscriptionHandle> {
		self.shard(key).read().get(key).and_then(|e| e.upstream.clone())
	}

	pub fn watch_count(&self, key: &AggregatedKey) -> usize {
		self.shard(key).read().get(key).map(|e| e.watches.len()).unwrap_or(0)
	}

	/// Snapshot of the watches currently bound to `key`, for fan-out. Taken
	/// under the shard lock and then released — callers must not assume the
	/// set is still current by the time they act on it.
	pub fn bound_watches(&self, key: &AggregatedKey) -> Vec<WatchId> {
		self.shard(key).read().get(key).map(|e| e.watches.iter().copied().collect()).unwrap_or_default()
	}

	/// Flushes one key, or every key if `key` is `None`. Returns the watches
	/// that were bound to whatever was cleared, so the caller (the
	/// orchestrator) can tell them `ErrorKind::CacheCleared` and their
	/// upstream subscriptions can be torn down.
	pub fn clear(&self, key: Option<&AggregatedKey>) -> Vec<(AggregatedKey, HashSet<WatchId>, Option<SubscriptionHandle>)> {
		match key {
			Some(key) => {
				let mut shard = self.shard(key).write();
				match shard.remove(key) {
					Some(entry) => vec![(key.clone(), entry.watches, entry.upstream)],
					None => vec![],
				}
			},
			None => {
				let mut cleared = Vec::new();
				for shard in &self.shards {
					let mut shard = shard.write();
					for (key, entry) in shard.drain() {
						cleared.push((key, entry.watches, entry.upstream));
					}
				}
				cleared
			},
		}
	}

	pub fn keys(&self) -> Vec<AggregatedKey> {
		self.shards.iter().flat_map(|shard| shard.read().keys().cloned().collect::<Vec<_>>()).collect()
	}

	pub fn version(&self, key: &AggregatedKey) -> Option<u64> {
		self.shard(key).read().get(key).map(|e| e.version)
	}

	/// Human-readable dump of one entry for the admin surface: version,
	/// payload kind, and the resource-name/version index. Not meant to be
	/// machine-parsed.
	pub fn dump(&self, key: &AggregatedKey) -> Option<String> {
		let shard = self.shard(key).read();
		let entry = shard.get(key)?;
		let payload = match &entry.payload {
			EntryPayload::Empty => "empty".to_string(),
			EntryPayload::StickyError(err) => format!("sticky_error({err})"),
			EntryPayload::Response(resp) => format!("response(type_url={}, resources={})", resp.type_url, resp.resources.len()),
		};
		let mut resources: Vec<_> = entry.resource_index.iter().collect();
		resources.sort();
		Some(format!(
			"key={key} version={} watches={} payload={payload} resources={resources:?}",
			entry.version,
			entry.watches.len(),
		))
	}

	/// The resource-name index for `key`, in the shape the admin `eds` dump
	/// has historically exposed (name -> version), regardless of type URL.
	pub fn resource_index(&self, key: &AggregatedKey) -> Option<HashMap<String, String>> {
		self.shard(key).read().get(key).map(|e| e.resource_index.clone())
	}

	/// Evicts entries that are both past their stale-serve window and have
	/// no bound watches. Returns the evicted keys so the upstream manager
	/// can close the matching subscription.
	pub fn sweep(&self, now: Instant) -> Vec<AggregatedKey> {
		let mut evicted = Vec::new();
		for shard in &self.shards {
			let mut shard = shard.write();
			shard.retain(|key, entry| {
				let expired = now >= entry.stale_serve_until;
				let idle = entry.watches.is_empty();
				if expired && idle {
					debug!(%key, "sweeping idle expired cache entry");
					evicted.push(key.clone());
					false
				} else {
					true
				}
			});
		}
		evicted
	}
}

#[cfg(test)]
mod tests {
	use relay_core::strng;
	use relay_xds::ResourceEntry;

	use super::*;

	fn response(resources: &[(&str, &str)]) -> Arc<Response> {
		Arc::new(Response {
			type_url: strng::new("type.googleapis.com/envoy.config.cluster.v3.Cluster"),
			version_info: strng::new("1"),
			nonce: strng::new("n1"),
			resources: resources
				.iter()
				.map(|(name, version)| ResourceEntry {
					name: strng::new(*name),
					version: strng::new(*version),
					body: prost_types::Any::default(),
				})
				.collect(),
		})
	}

	#[test]
	fn fetch_reports_miss_before_any_set() {
		let cache = ResponseCache::new(CacheConfig::default());
		let key = AggregatedKey::new("k1");
		assert!(matches!(cache.fetch(&key, Instant::now()), FetchResult::Miss));
	}

	#[test]
	fn set_response_then_fetch_is_fresh() {
		let cache = ResponseCache::new(CacheConfig::default());
		let key = AggregatedKey::new("k1");
		let now = Instant::now();
		cache.set_response(&key, response(&[("a", "1")]), now);
		assert!(matches!(cache.fetch(&key, now), FetchResult::Fresh(_)));
	}

	#[test]
	fn fetch_serves_stale_inside_grace_window_then_misses() {
		let config =
			CacheConfig { ttl: Duration::from_millis(10), stale_serve_window: Duration::from_millis(10), shard_count: 4, max_entries: 100 };
		let cache = ResponseCache::new(config);
		let key = AggregatedKey::new("k1");
		let t0 = Instant::now();
		cache.set_response(&key, response(&[("a", "1")]), t0);
		assert!(matches!(cache.fetch(&key, t0 + Duration::from_millis(15)), FetchResult::Stale(_)));
		assert!(matches!(cache.fetch(&key, t0 + Duration::from_millis(25)), FetchResult::Miss));
	}

	#[test]
	fn set_response_computes_added_and_removed() {
		let cache = ResponseCache::new(CacheConfig::default());
		let key = AggregatedKey::new("k1");
		let now = Instant::now();
		cache.set_response(&key, response(&[("a", "1"), ("b", "1")]), now);
		let delta = cache.set_response(&key, response(&[("a", "1"), ("c", "1")]), now);
		assert_eq!(delta.added_or_updated, vec!["c".to_string()]);
		assert_eq!(delta.removed, vec!["b".to_string()]);
	}

	#[test]
	fn remove_watch_reports_when_entry_becomes_idle() {
		let cache = ResponseCache::new(CacheConfig::default());
		let key = AggregatedKey::new("k1");
		let now = Instant::now();
		let id = make_watch_id();
		cache.add_watch(&key, id, now);
		assert_eq!(cache.watch_count(&key), 1);
		assert!(cache.remove_watch(&key, id));
	}

	fn make_watch_id() -> WatchId {
		let registry = relay_registry::DownstreamRegistry::default();
		let request = relay_xds::Request {
			type_url: strng::new("t"),
			resource_names: Default::default(),
			node: Default::default(),
			last_acked_version: None,
			last_acked_nonce: None,
			nacked: false,
			variant: relay_xds::XdsVariant::V3,
		};
		let (watch, _rx) = registry.create(request);
		watch.id()
	}

	#[test]
	fn clear_one_key_returns_only_its_watches() {
		let cache = ResponseCache::new(CacheConfig::default());
		let k1 = AggregatedKey::new("k1");
		let k2 = AggregatedKey::new("k2");
		let now = Instant::now();
		cache.set_response(&k1, response(&[("a", "1")]), now);
		cache.set_response(&k2, response(&[("b", "1")]), now);
		let cleared = cache.clear(Some(&k1));
		assert_eq!(cleared.len(), 1);
		assert!(matches!(cache.fetch(&k1, now), FetchResult::Miss));
		assert!(matches!(cache.fetch(&k2, now), FetchResult::Fresh(_)));
	}

	#[test]
	fn evicts_least_recently_touched_idle_entry_over_capacity() {
		let config = CacheConfig { ttl: Duration::from_secs(300), stale_serve_window: Duration::from_secs(30), shard_count: 1, max_entries: 2 };
		let cache = ResponseCache::new(config);
		let k1 = AggregatedKey::new("k1");
		let k2 = AggregatedKey::new("k2");
		let k3 = AggregatedKey::new("k3");
		let t0 = Instant::now();
		cache.set_response(&k1, response(&[("a", "1")]), t0);
		cache.set_response(&k2, response(&[("b", "1")]), t0 + Duration::from_millis(1));
		assert!(cache.evict_over_capacity(&k2).is_empty());

		cache.set_response(&k3, response(&[("c", "1")]), t0 + Duration::from_millis(2));
		let evicted = cache.evict_over_capacity(&k3);
		assert_eq!(evicted.len(), 1);
		assert_eq!(evicted[0].0, k1);
		assert!(matches!(cache.fetch(&k1, t0 + Duration::from_millis(2)), FetchResult::Miss));
	}

	#[test]
	fn never_evicts_entries_with_bound_watches() {
		let config = CacheConfig { ttl: Duration::from_secs(300), stale_serve_window: Duration::from_secs(30), shard_count: 1, max_entries: 1 };
		let cache = ResponseCache::new(config);
		let k1 = AggregatedKey::new("k1");
		let k2 = AggregatedKey::new("k2");
		let now = Instant::now();
		cache.set_response(&k1, response(&[("a", "1")]), now);
		cache.add_watch(&k1, make_watch_id(), now);
		cache.set_response(&k2, response(&[("b", "1")]), now + Duration::from_millis(1));

		let evicted = cache.evict_over_capacity(&k2);
		assert_eq!(evicted.len(), 1);
		assert_eq!(evicted[0].0, k2);
		assert!(matches!(cache.fetch(&k1, now), FetchResult::Fresh(_)));
	}

	#[test]
	fn sweep_only_evicts_idle_expired_entries() {
		let config =
			CacheConfig { ttl: Duration::from_millis(5), stale_serve_window: Duration::from_millis(5), shard_count: 4, max_entries: 100 };
		let cache = ResponseCache::new(config);
		let idle_key = AggregatedKey::new("idle");
		let bound_key = AggregatedKey::new("bound");
		let now = Instant::now();
		cache.set_response(&idle_key, response(&[("a", "1")]), now);
		cache.set_response(&bound_key, response(&[("b", "1")]), now);
		cache.add_watch(&bound_key, make_watch_id(), now);
		let evicted = cache.sweep(now + Duration::from_millis(20));
		assert_eq!(evicted, vec![idle_key]);
	}
}
