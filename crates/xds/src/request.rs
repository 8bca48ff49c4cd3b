use std::collections::BTreeSet;
use std::fmt;

use relay_core::strng::{self, Strng};

use crate::proto_gen::v3;

/// xDS comes in two wire-compatible-but-not-identical generations. The core
/// never branches on this beyond carrying it as a tag applied by the
/// transport shim at the edge (see spec design note on duck-typed variants);
/// everything downstream of `Request` treats it opaquely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum XdsVariant {
	V2,
	V3,
}

/// The subset of `Node` fields the aggregation mapper is allowed to key on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
	pub id: Strng,
	pub cluster: Strng,
	pub region: Strng,
	pub zone: Strng,
	pub sub_zone: Strng,
}

impl NodeIdentity {
	pub fn field(&self, name: &str) -> Option<&Strng> {
		match name {
			"id" => Some(&self.id),
			"cluster" => Some(&self.cluster),
			"region" => Some(&self.region),
			"zone" => Some(&self.zone),
			"sub_zone" | "subzone" => Some(&self.sub_zone),
			_ => None,
		}
	}
}

fn metadata_field(metadata: &Option<prost_types::Struct>, key: &str) -> Strng {
	let Some(metadata) = metadata else {
		return strng::EMPTY;
	};
	match metadata.fields.get(key).map(|v| &v.kind) {
		Some(Some(prost_types::value::Kind::StringValue(s))) => strng::new(s),
		_ => strng::EMPTY,
	}
}

impl From<&v3::Node> for NodeIdentity {
	fn from(node: &v3::Node) -> Self {
		NodeIdentity {
			id: strng::new(&node.id),
			cluster: strng::new(&node.cluster),
			region: metadata_field(&node.metadata, "REGION"),
			zone: metadata_field(&node.metadata, "ZONE"),
			sub_zone: metadata_field(&node.metadata, "SUB_ZONE"),
		}
	}
}

/// Protocol-version-agnostic view of an inbound (or outbound-to-upstream)
/// discovery request. Two requests are identity-equal only if every field
/// matches; the derived `PartialEq`/`Hash` below *is* that identity, and the
/// downstream registry uses `Request` itself as its key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Request {
	pub type_url: Strng,
	/// Empty means wildcard (subscribe to everything of this type).
	pub resource_names: BTreeSet<Strng>,
	pub node: NodeIdentity,
	pub last_acked_version: Option<Strng>,
	pub last_acked_nonce: Option<Strng>,
	/// Set when this request carries a NACK (`error_detail` was present on
	/// the wire). A NACK always echoes the nonce of the rejected response
	/// while its acked version stays at the last known-good one, which is
	/// exactly what `acked_no_later_than` already compares on — this field
	/// only exists so callers can tell a NACK apart from a plain redundant
	/// ACK of the same version/nonce pair.
	pub nacked: bool,
	pub variant: XdsVariant,
}

impl Request {
	pub fn from_sotw(req: v3::DiscoveryRequest, variant: XdsVariant) -> Self {
		let node = req.node.as_ref().map(NodeIdentity::from).unwrap_or_default();
		Request {
			type_url: strng::new(&req.type_url),
			resource_names: req.resource_names.iter().map(strng::new).collect(),
			node,
			last_acked_version: (!req.version_info.is_empty()).then(|| strng::new(&req.version_info)),
			last_acked_nonce: (!req.response_nonce.is_empty()).then(|| strng::new(&req.response_nonce)),
			nacked: req.error_detail.is_some(),
			variant,
		}
	}

	pub fn from_delta(req: &v3::DeltaDiscoveryRequest, variant: XdsVariant) -> Self {
		let node = req.node.as_ref().map(NodeIdentity::from).unwrap_or_default();
		Request {
			type_url: strng::new(&req.type_url),
			resource_names: req.resource_names_subscribe.iter().map(strng::new).collect(),
			node,
			last_acked_version: None,
			last_acked_nonce: (!req.response_nonce.is_empty()).then(|| strng::new(&req.response_nonce)),
			nacked: req.error_detail.is_some(),
			variant,
		}
	}

	/// True if `other`'s acked version is no newer than `self`'s — used by
	/// the upstream manager to pick the safest (lowest) version to resend.
	pub fn acked_no_later_than(&self, other: &Request) -> bool {
		self.last_acked_version.as_ref() <= other.last_acked_version.as_ref()
	}
}

/// A single resource within a `Response`, kept in the wire-opaque
/// `google.protobuf.Any` form: the core never decodes resource bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceEntry {
	pub name: Strng,
	pub version: Strng,
	pub body: prost_types::Any,
}

/// Immutable once constructed; `version` is the relay's cache version, not
/// necessarily the upstream's wire `version_info` (the two are related but
/// distinct, see the cache's versioning invariant).
#[derive(Clone, Debug)]
pub struct Response {
	pub type_url: Strng,
	pub version_info: Strng,
	pub nonce: Strng,
	pub resources: Vec<ResourceEntry>,
}

impl Response {
	pub fn to_sotw(&self) -> v3::DiscoveryResponse {
		v3::DiscoveryResponse {
			version_info: self.version_info.to_string(),
			resources: self.resources.iter().map(|r| r.body.clone()).collect(),
			type_url: self.type_url.to_string(),
			nonce: self.nonce.to_string(),
			control_plane: None,
		}
	}

	pub fn to_delta(&self, removed: &[Strng]) -> v3::DeltaDiscoveryResponse {
		v3::DeltaDiscoveryResponse {
			system_version_info: self.version_info.to_string(),
			resources: self
				.resources
				.iter()
				.map(|r| v3::Resource {
					name: r.name.to_string(),
					version: r.version.to_string(),
					resource: Some(r.body.clone()),
					aliases: vec![],
				})
				.collect(),
			type_url: self.type_url.to_string(),
			removed_resources: removed.iter().map(|s| s.to_string()).collect(),
			nonce: self.nonce.to_string(),
		}
	}
}

impl fmt::Display for XdsVariant {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			XdsVariant::V2 => "v2",
			XdsVariant::V3 => "v3",
		})
	}
}
