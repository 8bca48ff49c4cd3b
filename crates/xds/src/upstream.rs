use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use relay_core::error::panic_to_internal;
use relay_core::key::AggregatedKey;
use relay_core::ErrorKind;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::metrics::{ConnectionTerminationReason, Metrics};
use crate::proto_gen::v3::aggregated_discovery_service_client::AggregatedDiscoveryServiceClient;
use crate::proto_gen::v3::{DiscoveryRequest, DiscoveryResponse, Node, Status as XdsStatus};
use crate::request::{Request, Response, ResourceEntry};

/// Observable states of a per-key upstream subscription (spec.md §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionState {
	Idle = 0,
	Connecting = 1,
	Streaming = 2,
	Backoff = 3,
	Draining = 4,
	Closed = 5,
}

impl SubscriptionState {
	fn from_u8(v: u8) -> Self {
		match v {
			1 => SubscriptionState::Connecting,
			2 => SubscriptionState::Streaming,
			3 => SubscriptionState::Backoff,
			4 => SubscriptionState::Draining,
			5 => SubscriptionState::Closed,
			_ => SubscriptionState::Idle,
		}
	}
}

struct StateCell(AtomicU8);

impl StateCell {
	fn new(s: SubscriptionState) -> Self {
		Self(AtomicU8::new(s as u8))
	}
	fn set(&self, s: SubscriptionState) {
		self.0.store(s as u8, Ordering::Release);
	}
	fn get(&self) -> SubscriptionState {
		SubscriptionState::from_u8(self.0.load(Ordering::Acquire))
	}
}

/// Exponential backoff with full jitter, capped — mirrors the teacher's
/// `AdsClient` backoff schedule (10ms initial, doubling, 15s ceiling by
/// default here configurable via `UpstreamConfig`).
#[derive(Clone)]
pub struct Backoff {
	initial: Duration,
	max: Duration,
	current: Duration,
}

impl Backoff {
	pub fn new(initial: Duration, max: Duration) -> Self {
		Self { initial, max, current: initial }
	}

	pub fn next(&mut self) -> Duration {
		let jittered = {
			let mut rng = rand::rng();
			let factor: f64 = rng.random_range(0.5..1.0);
			Duration::from_secs_f64(self.current.as_secs_f64() * factor)
		};
		self.current = std::cmp::min(self.max, self.current * 2);
		jittered
	}

	pub fn reset(&mut self) {
		self.current = self.initial;
	}
}

/// Intents posted to a subscription's owning task. External callers never
/// mutate subscription state directly (spec.md §5's "single task owns
/// state" policy) — they post a message and the task applies it.
enum Intent {
	/// A watch (re)bound to this key; carries the request to (re)send
	/// upstream, already coalesced to the lowest acked version by the
	/// caller (orchestrator, which sees every bound watch).
	Rebind(Request),
	/// The last bound watch was removed; start the linger/drain timer.
	Drain,
	/// A new watch bound while draining; cancel the pending teardown.
	CancelDrain,
	Close,
}

/// A cheap, cloneable reference to a running (or about to run) subscription
/// task. Held by the cache entry; re-resolved by key on every access, never
/// stashed as a raw pointer into the entry (spec.md §3 ownership note).
/// The `intents` sender lives behind a lock because a panicked subscription
/// task is restarted with a fresh `Intent` channel (the old receiver died
/// with the task) — every handle clone must see the new sender, not the
/// dead one it was constructed with.
#[derive(Clone)]
pub struct SubscriptionHandle {
	intents: Arc<SyncMutex<mpsc::Sender<Intent>>>,
	state: Arc<StateCell>,
	cancel: CancellationToken,
}

impl SubscriptionHandle {
	pub fn state(&self) -> SubscriptionState {
		self.state.get()
	}

	/// Called by the orchestrator when a watch (re)binds to this key.
	pub fn rebind(&self, lowest_acked: Request) {
		let _ = self.intents.lock().try_send(Intent::Rebind(lowest_acked));
	}

	/// Called by the orchestrator when the bound-watch set becomes empty.
	pub fn start_drain(&self) {
		let _ = self.intents.lock().try_send(Intent::Drain);
	}

	/// Called by the orchestrator when a new watch binds during Draining.
	pub fn cancel_drain(&self) {
		let _ = self.intents.lock().try_send(Intent::CancelDrain);
	}

	pub fn close(&self) {
		let _ = self.intents.lock().try_send(Intent::Close);
		self.cancel.cancel();
	}
}

/// Implemented by the orchestrator; decouples the upstream manager from the
/// cache/registry crates it must not depend on.
pub trait UpstreamResponseSink: Send + Sync + 'static {
	fn on_response(&self, key: &AggregatedKey, response: Response);
	fn on_subscription_error(&self, key: &AggregatedKey, err: ErrorKind);
}

#[derive(Clone, Debug)]
pub struct UpstreamManagerConfig {
	pub initial_backoff: Duration,
	pub max_backoff: Duration,
	pub linger: Duration,
	pub max_concurrent_subscriptions: usize,
	/// The relay's own identity, presented to upstream as the `Node` of
	/// every request it issues — upstream servers see the relay as a
	/// single client, never the downstream node that originated a watch.
	pub node_id: String,
	pub node_cluster: String,
}

impl Default for UpstreamManagerConfig {
	fn default() -> Self {
		Self {
			initial_backoff: Duration::from_millis(10),
			max_backoff: Duration::from_secs(15),
			linger: Duration::from_secs(5),
			max_concurrent_subscriptions: 4096,
			node_id: "xds-relay".to_string(),
			node_cluster: "xds-relay".to_string(),
		}
	}
}

/// Origin selection: first matching `key_pattern` (`*` = wildcard, otherwise
/// an exact aggregated-key match) wins, mirroring the aggregation mapper's
/// own first-match-wins rule shape.
#[derive(Clone, Debug)]
pub struct OriginRoute {
	pub key_pattern: String,
	pub address: String,
}

fn resolve_origin<'a>(routes: &'a [OriginRoute], key: &AggregatedKey) -> Option<&'a str> {
	routes
		.iter()
		.find(|r| r.key_pattern == "*" || r.key_pattern == key.as_str())
		.map(|r| r.address.as_str())
}

/// Owns at most one live upstream subscription per aggregated key.
pub struct UpstreamManager {
	routes: Vec<OriginRoute>,
	config: UpstreamManagerConfig,
	metrics: Metrics,
	sink: Arc<dyn UpstreamResponseSink>,
	subscriptions: Mutex<std::collections::HashMap<AggregatedKey, SubscriptionHandle>>,
}

impl UpstreamManager {
	pub fn new(routes: Vec<OriginRoute>, config: UpstreamManagerConfig, metrics: Metrics, sink: Arc<dyn UpstreamResponseSink>) -> Self {
		Self {
			routes,
			config,
			metrics,
			sink,
			subscriptions: Mutex::new(std::collections::HashMap::new()),
		}
	}

	/// Opens a new subscription for `key` if none exists, or joins (rebinds)
	/// the existing one. Returns the handle either way.
	#[instrument(skip_all, fields(key = %key))]
	pub async fn open_or_join(&self, key: AggregatedKey, seed: Request) -> Result<SubscriptionHandle, ErrorKind> {
		let mut subs = self.subscriptions.lock().await;
		if let Some(existing) = subs.get(&key) {
			existing.cancel_drain();
			existing.rebind(seed);
			return Ok(existing.clone());
		}
		if subs.len() >= self.config.max_concurrent_subscriptions {
			return Err(ErrorKind::ResourceExhausted("max_concurrent_subscriptions".into()));
		}
		let Some(address) = resolve_origin(&self.routes, &key) else {
			return Err(ErrorKind::Internal(format!("no origin configured for key {key}")));
		};
		let address = address.to_string();
		let (tx, rx) = mpsc::channel(64);
		let state = Arc::new(StateCell::new(SubscriptionState::Connecting));
		let cancel = CancellationToken::new();
		let intents = Arc::new(SyncMutex::new(tx));
		let handle = SubscriptionHandle { intents: intents.clone(), state: state.clone(), cancel: cancel.clone() };

		let sink = self.sink.clone();
		let metrics = self.metrics.clone();
		let cfg = self.config.clone();
		let k = key.clone();
		tokio::spawn(supervise_subscription(k, address, seed, intents, rx, sink, metrics, cfg, state, cancel));

		subs.insert(key, handle.clone());
		Ok(handle)
	}

	pub async fn update_request(&self, key: &AggregatedKey, req: Request) {
		if let Some(handle) = self.subscriptions.lock().await.get(key) {
			handle.rebind(req);
		}
	}

	pub async fn close(&self, key: &AggregatedKey) {
		if let Some(handle) = self.subscriptions.lock().await.remove(key) {
			handle.close();
		}
	}

	pub async fn state_of(&self, key: &AggregatedKey) -> Option<SubscriptionState> {
		self.subscriptions.lock().await.get(key).map(|h| h.state())
	}
}

/// Owns the `Intent` channel endpoint across restarts and supervises
/// `run_subscription`, catching panics at the task boundary (spec's panic
/// handling contract): a panicked subscription task is translated to
/// `ErrorKind::Internal` via [`panic_to_internal`], logged, counted, and the
/// subscription is restarted with a fresh channel rather than left dead.
/// Restart reseeds from the subscription's original request rather than
/// whatever it had last been rebound to — any rebind that happened after the
/// last restart is recovered on the next watch bind or cancel/rebind cycle.
#[allow(clippy::too_many_arguments)]
async fn supervise_subscription(
	key: AggregatedKey,
	address: String,
	seed: Request,
	intents: Arc<SyncMutex<mpsc::Sender<Intent>>>,
	mut rx: mpsc::Receiver<Intent>,
	sink: Arc<dyn UpstreamResponseSink>,
	metrics: Metrics,
	cfg: UpstreamManagerConfig,
	state: Arc<StateCell>,
	cancel: CancellationToken,
) {
	loop {
		let task = tokio::spawn(run_subscription(
			key.clone(),
			address.clone(),
			seed.clone(),
			rx,
			sink.clone(),
			metrics.clone(),
			cfg.clone(),
			state.clone(),
			cancel.clone(),
		));
		match task.await {
			Ok(()) => return,
			Err(join_err) if join_err.is_panic() => {
				let err = panic_to_internal(join_err.into_panic());
				warn!(%key, %err, "upstream subscription task panicked, restarting");
				metrics.record(&ConnectionTerminationReason::Panicked, 1);
				sink.on_subscription_error(&key, err);
				let (tx, new_rx) = mpsc::channel(64);
				*intents.lock() = tx;
				rx = new_rx;
				state.set(SubscriptionState::Connecting);
			},
			Err(_) => return,
		}
	}
}

async fn run_subscription(
	key: AggregatedKey,
	address: String,
	mut seed: Request,
	mut intents: mpsc::Receiver<Intent>,
	sink: Arc<dyn UpstreamResponseSink>,
	metrics: Metrics,
	cfg: UpstreamManagerConfig,
	state: Arc<StateCell>,
	cancel: CancellationToken,
) {
	let mut backoff = Backoff::new(cfg.initial_backoff, cfg.max_backoff);
	loop {
		if cancel.is_cancelled() {
			state.set(SubscriptionState::Closed);
			return;
		}
		state.set(SubscriptionState::Connecting);
		match stream_once(&key, &address, &mut seed, &mut intents, &sink, &metrics, &state, &cfg, &cancel).await {
			StreamOutcome::Close => {
				state.set(SubscriptionState::Closed);
				return;
			},
			StreamOutcome::DrainExpired => {
				metrics.record(&ConnectionTerminationReason::Complete, 1);
				state.set(SubscriptionState::Closed);
				return;
			},
			StreamOutcome::Reconnect => {
				metrics.record(&ConnectionTerminationReason::Reconnect, 1);
				backoff.reset();
			},
			StreamOutcome::Retry(err) => {
				sink.on_subscription_error(&key, err);
				state.set(SubscriptionState::Backoff);
				let delay = backoff.next();
				tokio::select! {
					_ = tokio::time::sleep(delay) => {},
					_ = cancel.cancelled() => {
						state.set(SubscriptionState::Closed);
						return;
					}
				}
			},
		}
	}
}

enum StreamOutcome {
	/// Benign disconnect (goaway, cancelled, deadline exceeded): reconnect
	/// immediately with backoff reset.
	Reconnect,
	/// Transient failure: backoff and retry.
	Retry(ErrorKind),
	/// Drain timer elapsed with no rebind: tear down for good.
	DrainExpired,
	/// Explicit `close()` was called.
	Close,
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(key = %key, address = %address))]
async fn stream_once(
	key: &AggregatedKey,
	address: &str,
	seed: &mut Request,
	intents: &mut mpsc::Receiver<Intent>,
	sink: &Arc<dyn UpstreamResponseSink>,
	metrics: &Metrics,
	state: &Arc<StateCell>,
	cfg: &UpstreamManagerConfig,
	cancel: &CancellationToken,
) -> StreamOutcome {
	let mut client = match AggregatedDiscoveryServiceClient::connect(address.to_string()).await {
		Ok(c) => c,
		Err(e) => return StreamOutcome::Retry(ErrorKind::UpstreamDialFailure(e.to_string())),
	};

	let (req_tx, req_rx) = mpsc::channel::<DiscoveryRequest>(16);
	let initial = to_wire_request(seed, "", cfg);
	if req_tx.send(initial).await.is_err() {
		return StreamOutcome::Retry(ErrorKind::Internal("failed to queue initial request".into()));
	}

	let outbound = tokio_stream::wrappers::ReceiverStream::new(req_rx);
	let response = match client.stream_aggregated_resources(tonic::Request::new(outbound)).await {
		Ok(r) => r,
		Err(status) => return classify_status(&status),
	};
	let mut inbound = response.into_inner();
	state.set(SubscriptionState::Streaming);
	info!("upstream subscription streaming");

	let mut draining_since: Option<tokio::time::Instant> = None;
	loop {
		let drain_sleep = async {
			match draining_since {
				Some(since) => tokio::time::sleep_until(since + cfg.linger).await,
				None => std::future::pending().await,
			}
		};
		tokio::select! {
			_ = cancel.cancelled() => {
				return StreamOutcome::Close;
			}
			_ = drain_sleep => {
				return StreamOutcome::DrainExpired;
			}
			intent = intents.recv() => {
				match intent {
					Some(Intent::Rebind(req)) => {
						*seed = req.clone();
						draining_since = None;
						state.set(SubscriptionState::Streaming);
						let wire = to_wire_request(&req, "", cfg);
						if req_tx.send(wire).await.is_err() {
							return StreamOutcome::Retry(ErrorKind::UpstreamStreamError("request channel closed".into()));
						}
					}
					Some(Intent::Drain) => {
						draining_since = Some(tokio::time::Instant::now());
						state.set(SubscriptionState::Draining);
						debug!("draining: no bound watches remain");
					}
					Some(Intent::CancelDrain) => {
						draining_since = None;
						state.set(SubscriptionState::Streaming);
					}
					Some(Intent::Close) | None => {
						return StreamOutcome::Close;
					}
				}
			}
			msg = inbound.message() => {
				match msg {
					Ok(Some(resp)) => {
						metrics.record(&resp, ());
						let (response, nonce, ack) = decode_response(&resp, seed);
						sink.on_response(key, response);
						let ack_req = to_wire_request(seed, &nonce, cfg);
						let ack_req = DiscoveryRequest { response_nonce: nonce, error_detail: ack.err(), ..ack_req };
						if req_tx.send(ack_req).await.is_err() {
							return StreamOutcome::Retry(ErrorKind::UpstreamStreamError("request channel closed".into()));
						}
					}
					Ok(None) => return StreamOutcome::Reconnect,
					Err(status) => return classify_status(&status),
				}
			}
		}
	}
}

fn to_wire_request(req: &Request, nonce: &str, cfg: &UpstreamManagerConfig) -> DiscoveryRequest {
	DiscoveryRequest {
		version_info: req.last_acked_version.as_deref().unwrap_or("").to_string(),
		node: Some(Node {
			id: cfg.node_id.clone(),
			cluster: cfg.node_cluster.clone(),
			metadata: None,
		}),
		resource_names: req.resource_names.iter().map(|s| s.to_string()).collect(),
		type_url: req.type_url.to_string(),
		response_nonce: nonce.to_string(),
		error_detail: None,
	}
}

fn decode_response(resp: &DiscoveryResponse, req: &Request) -> (Response, String, Result<(), XdsStatus>) {
	// SOTW resources carry no per-entry name on the wire; the relay only
	// needs index-stable identity for its own delta bookkeeping, since it
	// never decodes the `Any` payload to read a real resource name.
	let resources = resp
		.resources
		.iter()
		.enumerate()
		.map(|(i, any)| ResourceEntry {
			name: relay_core::strng::new(format!("{}/{i}", resp.type_url)),
			version: relay_core::strng::new(&resp.version_info),
			body: any.clone(),
		})
		.collect();
	let response = Response {
		type_url: relay_core::strng::new(&resp.type_url),
		version_info: relay_core::strng::new(&resp.version_info),
		nonce: relay_core::strng::new(&resp.nonce),
		resources,
	};
	let _ = req.variant;
	(response, resp.nonce.clone(), Ok(()))
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use prometheus_client::registry::Registry;

	use super::*;
	use crate::request::XdsVariant;

	struct NoopSink;
	impl UpstreamResponseSink for NoopSink {
		fn on_response(&self, _key: &AggregatedKey, _response: Response) {}
		fn on_subscription_error(&self, _key: &AggregatedKey, _err: ErrorKind) {}
	}

	fn req(version: Option<&str>) -> Request {
		Request {
			type_url: relay_core::strng::new("type.googleapis.com/envoy.config.cluster.v3.Cluster"),
			resource_names: BTreeSet::from([relay_core::strng::new("a"), relay_core::strng::new("b")]),
			node: Default::default(),
			last_acked_version: version.map(relay_core::strng::new),
			last_acked_nonce: None,
			nacked: false,
			variant: XdsVariant::V3,
		}
	}

	#[test]
	fn backoff_starts_at_initial_and_never_exceeds_max() {
		let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(100));
		for _ in 0..10 {
			let delay = backoff.next();
			assert!(delay <= Duration::from_millis(100));
		}
	}

	#[test]
	fn backoff_reset_returns_to_initial() {
		let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(15));
		for _ in 0..5 {
			backoff.next();
		}
		backoff.reset();
		// Jittered to [0.5, 1.0) of `initial`, so strictly less than the next
		// rung up (20ms) even at the top of the jitter range.
		assert!(backoff.next() < Duration::from_millis(20));
	}

	#[test]
	fn resolve_origin_picks_first_matching_route_in_order() {
		let key = AggregatedKey::new("some-key");
		let routes = vec![
			OriginRoute { key_pattern: "other-key".to_string(), address: "http://a".to_string() },
			OriginRoute { key_pattern: "some-key".to_string(), address: "http://b".to_string() },
			OriginRoute { key_pattern: "*".to_string(), address: "http://c".to_string() },
		];
		assert_eq!(resolve_origin(&routes, &key), Some("http://b"));
	}

	#[test]
	fn resolve_origin_falls_back_to_wildcard() {
		let key = AggregatedKey::new("unmatched-key");
		let routes = vec![
			OriginRoute { key_pattern: "other-key".to_string(), address: "http://a".to_string() },
			OriginRoute { key_pattern: "*".to_string(), address: "http://c".to_string() },
		];
		assert_eq!(resolve_origin(&routes, &key), Some("http://c"));
	}

	#[test]
	fn resolve_origin_returns_none_with_no_match() {
		let key = AggregatedKey::new("unmatched-key");
		let routes = vec![OriginRoute { key_pattern: "other-key".to_string(), address: "http://a".to_string() }];
		assert_eq!(resolve_origin(&routes, &key), None);
	}

	#[test]
	fn to_wire_request_carries_acked_version_and_sorted_resource_names() {
		let cfg = UpstreamManagerConfig::default();
		let wire = to_wire_request(&req(Some("3")), "nonce-1", &cfg);
		assert_eq!(wire.version_info, "3");
		assert_eq!(wire.response_nonce, "nonce-1");
		assert_eq!(wire.resource_names, vec!["a".to_string(), "b".to_string()]);
		assert_eq!(wire.node.unwrap().id, cfg.node_id);
	}

	#[test]
	fn to_wire_request_defaults_version_to_empty_when_unacked() {
		let cfg = UpstreamManagerConfig::default();
		let wire = to_wire_request(&req(None), "", &cfg);
		assert_eq!(wire.version_info, "");
	}

	#[test]
	fn decode_response_builds_index_stable_resource_names() {
		let resp = DiscoveryResponse {
			version_info: "7".to_string(),
			resources: vec![prost_types::Any::default(), prost_types::Any::default()],
			type_url: "type.googleapis.com/envoy.config.cluster.v3.Cluster".to_string(),
			nonce: "n7".to_string(),
			control_plane: None,
		};
		let (response, nonce, ack) = decode_response(&resp, &req(None));
		assert_eq!(nonce, "n7");
		assert!(ack.is_ok());
		assert_eq!(response.version_info.as_str(), "7");
		assert_eq!(response.resources.len(), 2);
		assert_eq!(response.resources[0].name.as_str(), "type.googleapis.com/envoy.config.cluster.v3.Cluster/0");
		assert_eq!(response.resources[1].name.as_str(), "type.googleapis.com/envoy.config.cluster.v3.Cluster/1");
	}

	#[test]
	fn classify_status_treats_cancelled_and_deadline_exceeded_as_reconnect() {
		assert!(matches!(classify_status(&tonic::Status::cancelled("bye")), StreamOutcome::Reconnect));
		assert!(matches!(classify_status(&tonic::Status::deadline_exceeded("slow")), StreamOutcome::Reconnect));
	}

	#[test]
	fn classify_status_treats_goaway_unavailable_as_reconnect() {
		let status = tonic::Status::unavailable("received prior goaway: ENHANCE_YOUR_CALM");
		assert!(matches!(classify_status(&status), StreamOutcome::Reconnect));
	}

	#[test]
	fn classify_status_treats_other_unavailable_as_retry() {
		let status = tonic::Status::unavailable("connection refused");
		assert!(matches!(classify_status(&status), StreamOutcome::Retry(ErrorKind::UpstreamStreamError(_))));
	}

	#[test]
	fn classify_status_treats_auth_errors_as_terminal() {
		let status = tonic::Status::unauthenticated("bad token");
		assert!(matches!(classify_status(&status), StreamOutcome::Retry(ErrorKind::UpstreamTerminalError(_))));
	}

	#[tokio::test]
	async fn open_or_join_creates_a_connecting_subscription() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		let routes = vec![OriginRoute { key_pattern: "*".to_string(), address: "http://127.0.0.1:1".to_string() }];
		let manager = UpstreamManager::new(routes, UpstreamManagerConfig::default(), metrics, Arc::new(NoopSink));
		let key = AggregatedKey::new("some-key");

		let handle = manager.open_or_join(key.clone(), req(None)).await.unwrap();
		assert_eq!(handle.state(), SubscriptionState::Connecting);
		assert_eq!(manager.state_of(&key).await, Some(SubscriptionState::Connecting));
	}

	#[tokio::test]
	async fn open_or_join_joins_the_existing_subscription_for_the_same_key() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		let routes = vec![OriginRoute { key_pattern: "*".to_string(), address: "http://127.0.0.1:1".to_string() }];
		let manager = UpstreamManager::new(routes, UpstreamManagerConfig::default(), metrics, Arc::new(NoopSink));
		let key = AggregatedKey::new("some-key");

		let first = manager.open_or_join(key.clone(), req(None)).await.unwrap();
		let second = manager.open_or_join(key.clone(), req(Some("1"))).await.unwrap();
		assert_eq!(first.state(), second.state());
	}

	#[tokio::test]
	async fn open_or_join_rejects_beyond_max_concurrent_subscriptions() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		let routes = vec![OriginRoute { key_pattern: "*".to_string(), address: "http://127.0.0.1:1".to_string() }];
		let cfg = UpstreamManagerConfig { max_concurrent_subscriptions: 1, ..UpstreamManagerConfig::default() };
		let manager = UpstreamManager::new(routes, cfg, metrics, Arc::new(NoopSink));

		manager.open_or_join(AggregatedKey::new("k1"), req(None)).await.unwrap();
		let err = manager.open_or_join(AggregatedKey::new("k2"), req(None)).await.unwrap_err();
		assert!(matches!(err, ErrorKind::ResourceExhausted(_)));
	}

	#[tokio::test]
	async fn open_or_join_errors_with_no_matching_origin() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		let manager = UpstreamManager::new(vec![], UpstreamManagerConfig::default(), metrics, Arc::new(NoopSink));
		let err = manager.open_or_join(AggregatedKey::new("k1"), req(None)).await.unwrap_err();
		assert!(matches!(err, ErrorKind::Internal(_)));
	}

	#[tokio::test]
	async fn close_removes_the_subscription_from_the_manager() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		let routes = vec![OriginRoute { key_pattern: "*".to_string(), address: "http://127.0.0.1:1".to_string() }];
		let manager = UpstreamManager::new(routes, UpstreamManagerConfig::default(), metrics, Arc::new(NoopSink));
		let key = AggregatedKey::new("some-key");

		manager.open_or_join(key.clone(), req(None)).await.unwrap();
		manager.close(&key).await;
		assert_eq!(manager.state_of(&key).await, None);
	}
}

fn classify_status(status: &tonic::Status) -> StreamOutcome {
	use tonic::Code;
	let benign = matches!(status.code(), Code::Cancelled | Code::DeadlineExceeded)
		|| (status.code() == Code::Unavailable
			&& (status.message().contains("transport is closing") || status.message().contains("received prior goaway")));
	if benign {
		StreamOutcome::Reconnect
	} else if matches!(status.code(), Code::Unauthenticated | Code::PermissionDenied | Code::InvalidArgument) {
		StreamOutcome::Retry(ErrorKind::UpstreamTerminalError(status.to_string()))
	} else {
		warn!(%status, "upstream stream error");
		StreamOutcome::Retry(ErrorKind::UpstreamStreamError(status.to_string()))
	}
}
