//! Maps an inbound [`relay_xds::Request`] onto the [`relay_core::AggregatedKey`]
//! that names its upstream subscription.

mod rules;

pub use rules::{AggregationRules, Matcher, Predicate};

use relay_core::key::AggregatedKey;
use relay_core::ErrorKind;
use relay_xds::Request;

/// Computes the aggregated key for `request` under `rules`, or
/// `ErrorKind::NoAggregationRule` if nothing matches.
pub fn key(rules: &AggregationRules, request: &Request) -> Result<AggregatedKey, ErrorKind> {
	for matcher in &rules.matchers {
		if matcher.predicate.matches(request) {
			return Ok(AggregatedKey::new(matcher.render(request)));
		}
	}
	Err(ErrorKind::NoAggregationRule)
}
