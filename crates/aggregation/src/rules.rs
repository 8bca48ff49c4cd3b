use std::path::Path;

use regex::Regex;
use relay_xds::Request;
use serde::Deserialize;

/// Root of the aggregation rule file. `schema_version` exists so a future
/// breaking change to the rule grammar can be rejected explicitly rather than
/// silently misparsed.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationRules {
	pub schema_version: u32,
	pub matchers: Vec<Matcher>,
}

impl AggregationRules {
	pub fn load(path: &Path) -> anyhow::Result<Self> {
		let raw = fs_err::read_to_string(path)?;
		let rules: AggregationRules = serde_yaml::from_str(&raw)?;
		if rules.schema_version != 1 {
			anyhow::bail!("unsupported aggregation rules schema_version {}", rules.schema_version);
		}
		Ok(rules)
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Matcher {
	pub predicate: Predicate,
	pub key_template: String,
}

impl Matcher {
	pub fn render(&self, request: &Request) -> String {
		self
			.key_template
			.replace("<type>", &request.type_url)
			.replace("<cluster>", &request.node.cluster)
			.replace("<region>", &request.node.region)
			.replace("<zone>", &request.node.zone)
			.replace("<subzone>", &request.node.sub_zone)
			.replace("<node_id>", &request.node.id)
	}
}

/// A predicate over an inbound request. Untagged so rule files read as plain
/// YAML shorthand (`type_url: "..."`) rather than an explicit discriminant.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged, deny_unknown_fields)]
pub enum Predicate {
	TypeUrl {
		type_url: String,
	},
	NodeField {
		node_field: String,
		pattern: String,
	},
	ResourceName {
		resource_name: String,
	},
	AnyOf {
		any_of: Vec<Predicate>,
	},
	AllOf {
		all_of: Vec<Predicate>,
	},
}

impl Predicate {
	pub fn matches(&self, request: &Request) -> bool {
		match self {
			Predicate::TypeUrl { type_url } => request.type_url.as_str() == type_url,
			Predicate::NodeField { node_field, pattern } => {
				let Some(value) = request.node.field(node_field) else {
					return false;
				};
				Regex::new(pattern).map(|re| re.is_match(value)).unwrap_or(false)
			},
			Predicate::ResourceName { resource_name } => {
				let Ok(re) = Regex::new(resource_name) else {
					return false;
				};
				request.resource_names.iter().any(|name| re.is_match(name))
			},
			Predicate::AnyOf { any_of } => any_of.iter().any(|p| p.matches(request)),
			Predicate::AllOf { all_of } => all_of.iter().all(|p| p.matches(request)),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use relay_xds::{NodeIdentity, XdsVariant};

	use super::*;

	fn req() -> Request {
		Request {
			type_url: relay_core::strng::new("type.googleapis.com/envoy.config.cluster.v3.Cluster"),
			resource_names: BTreeSet::from([relay_core::strng::new("outbound|80||payments.default.svc.cluster.local")]),
			node: NodeIdentity {
				id: relay_core::strng::new("sidecar~10.0.0.1~pod.default"),
				cluster: relay_core::strng::new("payments"),
				region: relay_core::strng::new("us-west"),
				zone: relay_core::strng::EMPTY,
				sub_zone: relay_core::strng::EMPTY,
			},
			last_acked_version: None,
			last_acked_nonce: None,
			nacked: false,
			variant: XdsVariant::V3,
		}
	}

	#[test]
	fn node_field_regex_matches() {
		let p = Predicate::NodeField { node_field: "cluster".to_string(), pattern: "^pay.*".to_string() };
		assert!(p.matches(&req()));
	}

	#[test]
	fn resource_name_regex_matches() {
		let p = Predicate::ResourceName { resource_name: "payments".to_string() };
		assert!(p.matches(&req()));
	}

	#[test]
	fn all_of_requires_every_predicate() {
		let p = Predicate::AllOf {
			all_of: vec![
				Predicate::TypeUrl { type_url: "type.googleapis.com/envoy.config.cluster.v3.Cluster".to_string() },
				Predicate::NodeField { node_field: "cluster".to_string(), pattern: "nonexistent".to_string() },
			],
		};
		assert!(!p.matches(&req()));
	}

	#[test]
	fn render_substitutes_placeholders() {
		let m = Matcher {
			predicate: Predicate::TypeUrl { type_url: "x".to_string() },
			key_template: "<type>/<cluster>/<region>".to_string(),
		};
		assert_eq!(m.render(&req()), "type.googleapis.com/envoy.config.cluster.v3.Cluster/payments/us-west");
	}
}
