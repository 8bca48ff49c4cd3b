/// The error kinds surfaced to callers and to observability, per the relay's
/// error handling design: each kind carries its own recovery policy, applied
/// by the component that owns the affected scope (watch, subscription, cache
/// entry) rather than recovered at the origin.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ErrorKind {
	/// The request matched no aggregation rule. The watch is closed and not
	/// retried.
	#[error("no aggregation rule matched the request")]
	NoAggregationRule,
	/// Upstream dial failed. Backoff and retry; bound watches stay open.
	#[error("upstream dial failed: {0}")]
	UpstreamDialFailure(String),
	/// Mid-stream upstream error. Backoff and reconnect; cache preserved.
	#[error("upstream stream error: {0}")]
	UpstreamStreamError(String),
	/// Non-recoverable origin response. Sticky error for a bounded window.
	#[error("upstream terminal error: {0}")]
	UpstreamTerminalError(String),
	/// The downstream delivery sink was full. Only that watch is closed.
	#[error("slow consumer")]
	SlowConsumer,
	/// An admin invalidation closed the entry; watches must reconnect.
	#[error("cache cleared by admin")]
	CacheCleared,
	/// The process is draining.
	#[error("shutting down")]
	Shutdown,
	/// A configured resource limit was exceeded.
	#[error("resource exhausted: {0}")]
	ResourceExhausted(String),
	/// An invariant was violated; the owning scope is closed.
	#[error("internal error: {0}")]
	Internal(String),
}

impl ErrorKind {
	/// Stable label used for metrics and admin dumps.
	pub fn label(&self) -> &'static str {
		match self {
			ErrorKind::NoAggregationRule => "no_aggregation_rule",
			ErrorKind::UpstreamDialFailure(_) => "upstream_dial_failure",
			ErrorKind::UpstreamStreamError(_) => "upstream_stream_error",
			ErrorKind::UpstreamTerminalError(_) => "upstream_terminal_error",
			ErrorKind::SlowConsumer => "slow_consumer",
			ErrorKind::CacheCleared => "cache_cleared",
			ErrorKind::Shutdown => "shutdown",
			ErrorKind::ResourceExhausted(_) => "resource_exhausted",
			ErrorKind::Internal(_) => "internal",
		}
	}
}

/// Thin wrapper so panics caught at task boundaries carry a consistent
/// message without leaking panic payload internals.
pub fn panic_to_internal(payload: Box<dyn std::any::Any + Send>) -> ErrorKind {
	let msg = if let Some(s) = payload.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"task panicked".to_string()
	};
	ErrorKind::Internal(msg)
}
