pub mod metrics;
pub mod proto_gen;
pub mod request;
pub mod upstream;

pub use metrics::Metrics;
pub use proto_gen::v3;
pub use request::{NodeIdentity, Request, ResourceEntry, Response, XdsVariant};
pub use upstream::{
	Backoff, OriginRoute, SubscriptionHandle, SubscriptionState, UpstreamManager, UpstreamManagerConfig, UpstreamResponseSink,
};
