use std::pin::Pin;
use std::sync::Arc;

use futures_core::Stream;
use relay_orchestrator::{Delivery, Orchestrator};
use relay_xds::v3::aggregated_discovery_service_server::AggregatedDiscoveryService;
use relay_xds::v3::{DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse};
use relay_xds::{Request as RelayRequest, XdsVariant};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Status, Streaming};
use tracing::{info, instrument, warn};

/// The downstream-facing ADS server: translates inbound SOTW requests into
/// orchestrator watches and pumps cache-sourced responses back out. Every
/// inbound message (initial subscribe, ACK, or NACK) replaces whatever watch
/// was previously bound to this stream, mirroring how the original relay's
/// go-control-plane adapter re-registers a watch on every request.
pub struct DownstreamService {
	orchestrator: Arc<Orchestrator>,
}

impl DownstreamService {
	pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
		DownstreamService { orchestrator }
	}
}

type ResponseStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl AggregatedDiscoveryService for DownstreamService {
	type StreamAggregatedResourcesStream = ResponseStream;
	type DeltaAggregatedResourcesStream = Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send + 'static>>;

	#[instrument(skip_all)]
	async fn stream_aggregated_resources(
		&self,
		request: tonic::Request<Streaming<DiscoveryRequest>>,
	) -> Result<tonic::Response<Self::StreamAggregatedResourcesStream>, Status> {
		let mut inbound = request.into_inner();
		let orchestrator = self.orchestrator.clone();
		let (tx, rx) = tokio::sync::mpsc::channel(16);

		tokio::spawn(async move {
			let mut active: Option<(relay_registry::WatchId, relay_orchestrator::CancelHandle, tokio::sync::mpsc::Receiver<Delivery>)> = None;
			loop {
				tokio::select! {
					msg = inbound.message() => {
						match msg {
							Ok(Some(req)) => {
								if let Some((_, cancel, _)) = active.take() {
									cancel.cancel().await;
								}
								let relay_req = RelayRequest::from_sotw(req, XdsVariant::V3);
								match orchestrator.create_watch(relay_req).await {
									Ok((id, delivery_rx, cancel)) => {
										active = Some((id, cancel, delivery_rx));
									}
									Err(err) => {
										warn!(%err, "failed to establish watch");
										let _ = tx.send(Err(Status::failed_precondition(err.to_string()))).await;
										return;
									}
								}
							}
							Ok(None) => {
								info!("downstream stream closed");
								break;
							}
							Err(status) => {
								warn!(%status, "downstream stream error");
								break;
							}
						}
					}
					delivery = async {
						match &mut active {
							Some((_, _, rx)) => rx.recv().await,
							None => std::future::pending().await,
						}
					}, if active.is_some() => {
						let Some(delivery) = delivery else { break };
						match delivery {
							Delivery::Response(resp) => {
								if tx.send(Ok(resp.to_sotw())).await.is_err() {
									break;
								}
							}
							Delivery::Terminal(err) => {
								let _ = tx.send(Err(Status::unavailable(err.to_string()))).await;
								break;
							}
						}
					}
				}
			}
			if let Some((_, cancel, _)) = active.take() {
				cancel.cancel().await;
			}
		});

		Ok(tonic::Response::new(Box::pin(ReceiverStream::new(rx)) as Self::StreamAggregatedResourcesStream))
	}

	async fn delta_aggregated_resources(
		&self,
		_request: tonic::Request<Streaming<DeltaDiscoveryRequest>>,
	) -> Result<tonic::Response<Self::DeltaAggregatedResourcesStream>, Status> {
		Err(Status::unimplemented("delta xDS is not supported by this relay"))
	}
}
