use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use relay_core::metrics::Recorder;

use crate::proto_gen::v3::DiscoveryResponse;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionTerminationReason {
	ConnectionError,
	Error,
	Reconnect,
	Complete,
	Panicked,
}

impl ConnectionTerminationReason {
	fn label(self) -> &'static str {
		match self {
			ConnectionTerminationReason::ConnectionError => "connection_error",
			ConnectionTerminationReason::Error => "error",
			ConnectionTerminationReason::Reconnect => "reconnect",
			ConnectionTerminationReason::Complete => "complete",
			ConnectionTerminationReason::Panicked => "panicked",
		}
	}
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TerminationLabels {
	reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResponseLabels {
	type_url: String,
}

/// Per-subscription metrics, cheap to clone (internally `Arc`'d families).
#[derive(Clone)]
pub struct Metrics {
	connections_terminated: Family<TerminationLabels, Counter>,
	responses_received: Family<ResponseLabels, Counter>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let connections_terminated = Family::default();
		let responses_received = Family::default();
		registry.register(
			"xds_connection_terminations",
			"Count of upstream xDS stream terminations by reason",
			connections_terminated.clone(),
		);
		registry.register(
			"xds_responses_received",
			"Count of upstream xDS responses received by type",
			responses_received.clone(),
		);
		Metrics {
			connections_terminated,
			responses_received,
		}
	}
}

impl Recorder<&ConnectionTerminationReason, u64> for Metrics {
	fn record(&self, event: &ConnectionTerminationReason, meta: u64) {
		self
			.connections_terminated
			.get_or_create(&TerminationLabels {
				reason: event.label().to_string(),
			})
			.inc_by(meta);
	}
}

impl Recorder<&DiscoveryResponse, ()> for Metrics {
	fn record(&self, event: &DiscoveryResponse, _meta: ()) {
		self
			.responses_received
			.get_or_create(&ResponseLabels {
				type_url: event.type_url.clone(),
			})
			.inc();
	}
}
