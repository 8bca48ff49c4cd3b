//! Read/write admin HTTP surface (spec component C7): cache inspection,
//! readiness toggle, log level control, server info dump.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use relay_core::key::AggregatedKey;
use relay_core::logging::{LevelName, LogHandle};
use relay_orchestrator::Orchestrator;
use tokio::sync::watch;
use tracing::info;

const COMMANDS: &[(&str, &str)] = &[
	("/", "admin home page"),
	("/ready", "ready endpoint. usage: GET /ready, POST /ready/true or /ready/false"),
	("/cache/clear", "clear cache entry for a given key. usage: POST /cache/clear/<key>, omit key to clear all"),
	("/cache", "print cache entry for a given key. usage: GET /cache/<key>, omit key to dump all"),
	("/cache/version", "print the version for a particular key. usage: GET /cache/version/<key>"),
	("/cache/eds", "print the resource-name index for a particular key. usage: GET /cache/eds/<key>"),
	("/cache/keys", "print all aggregated keys currently cached"),
	("/log_level", "get or set the log level. usage: GET /log_level, POST /log_level/<level>"),
	("/server_info", "print bootstrap configuration"),
];

#[derive(Clone)]
struct AdminState {
	orchestrator: Arc<Orchestrator>,
	log_handle: Arc<LogHandle>,
	bootstrap_dump: Arc<str>,
	ready: watch::Sender<bool>,
}

/// No pprof-equivalent surface exists here (see the design notes): a Rust
/// service built on tokio has no single stdlib profiling endpoint to mirror
/// `net/http/pprof`, so `/debug/pprof/*` is a deliberate gap rather than a
/// silently-dropped feature.
pub fn router(orchestrator: Arc<Orchestrator>, log_handle: Arc<LogHandle>, bootstrap_dump: String, ready: watch::Sender<bool>) -> Router {
	let state = AdminState { orchestrator, log_handle, bootstrap_dump: bootstrap_dump.into(), ready };
	Router::new()
		.route("/", get(index))
		.route("/ready", get(ready_get))
		.route("/ready/{flag}", post(ready_set))
		.route("/cache/clear", post(clear_all))
		.route("/cache/clear/{key}", post(clear_one))
		.route("/cache", get(cache_dump_all))
		.route("/cache/{key}", get(cache_dump_one))
		.route("/cache/version/{key}", get(cache_version))
		.route("/cache/eds/{key}", get(cache_eds))
		.route("/cache/keys", get(cache_keys))
		.route("/log_level", get(log_level_get))
		.route("/log_level/{level}", post(log_level_set))
		.route("/server_info", get(server_info))
		.with_state(state)
}

async fn index() -> impl IntoResponse {
	let mut body = String::from("admin commands are:\n");
	for (pattern, description) in COMMANDS {
		body.push_str(&format!("  {pattern}: {description}\n"));
	}
	body
}

async fn ready_get(State(state): State<AdminState>) -> impl IntoResponse {
	format!("ready: {}\n", *state.ready.borrow())
}

async fn ready_set(State(state): State<AdminState>, Path(flag): Path<String>) -> impl IntoResponse {
	match flag.as_str() {
		"true" => {
			let _ = state.ready.send(true);
			(StatusCode::OK, "ready: true\n".to_string())
		},
		"false" => {
			let _ = state.ready.send(false);
			(StatusCode::OK, "ready: false\n".to_string())
		},
		other => (StatusCode::BAD_REQUEST, format!("invalid readiness value: {other}\n")),
	}
}

async fn clear_all(State(state): State<AdminState>) -> impl IntoResponse {
	let cleared = state.orchestrator.clear_cache(None);
	info!(entries = cleared, "cleared entire cache via admin");
	format!("cleared {cleared} entries\n")
}

async fn clear_one(State(state): State<AdminState>, Path(key): Path<String>) -> impl IntoResponse {
	let key = AggregatedKey::new(&key);
	let cleared = state.orchestrator.clear_cache(Some(&key));
	format!("cleared {cleared} entries for key {key}\n")
}

async fn cache_dump_all(State(state): State<AdminState>) -> impl IntoResponse {
	let mut body = String::new();
	for key in state.orchestrator.cache().keys() {
		if let Some(dump) = state.orchestrator.cache().dump(&key) {
			body.push_str(&dump);
			body.push('\n');
		}
	}
	body
}

async fn cache_dump_one(State(state): State<AdminState>, Path(key): Path<String>) -> impl IntoResponse {
	let key = AggregatedKey::new(&key);
	match state.orchestrator.cache().dump(&key) {
		Some(dump) => (StatusCode::OK, dump),
		None => (StatusCode::NOT_FOUND, format!("no cache entry for key {key}\n")),
	}
}

async fn cache_version(State(state): State<AdminState>, Path(key): Path<String>) -> impl IntoResponse {
	let key = AggregatedKey::new(&key);
	match state.orchestrator.cache().version(&key) {
		Some(version) => (StatusCode::OK, format!("{version}\n")),
		None => (StatusCode::NOT_FOUND, format!("no cache entry for key {key}\n")),
	}
}

async fn cache_eds(State(state): State<AdminState>, Path(key): Path<String>) -> impl IntoResponse {
	let key = AggregatedKey::new(&key);
	match state.orchestrator.cache().resource_index(&key) {
		Some(index) => {
			let mut entries: Vec<_> = index.into_iter().collect();
			entries.sort();
			(StatusCode::OK, format!("{entries:#?}\n"))
		},
		None => (StatusCode::NOT_FOUND, format!("no cache entry for key {key}\n")),
	}
}

async fn cache_keys(State(state): State<AdminState>) -> impl IntoResponse {
	let mut keys: Vec<_> = state.orchestrator.cache().keys().into_iter().map(|k| k.to_string()).collect();
	keys.sort();
	keys.join("\n") + "\n"
}

async fn log_level_get(State(state): State<AdminState>) -> impl IntoResponse {
	format!("Current log level: {}\n", state.log_handle.get_level().as_str())
}

async fn log_level_set(State(state): State<AdminState>, Path(level): Path<String>) -> impl IntoResponse {
	let Some(parsed) = LevelName::parse(&level) else {
		return (StatusCode::BAD_REQUEST, format!("Invalid log level: {level}\n"));
	};
	match state.log_handle.set_level(parsed) {
		Ok(()) => (StatusCode::OK, format!("Current log level: {}\n", state.log_handle.get_level().as_str())),
		Err(_) => (StatusCode::BAD_REQUEST, format!("Invalid log level: {level}\n")),
	}
}

async fn server_info(State(state): State<AdminState>) -> impl IntoResponse {
	format!("{}\n", state.bootstrap_dump)
}
