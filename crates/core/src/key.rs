use std::fmt;

use crate::strng::{self, Strng};

/// Opaque string produced by the aggregation mapper. The only invariant that
/// matters to every other component: `key(r) = key(r')` implies the upstream
/// answers `r` and `r'` with the same response payload.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregatedKey(Strng);

impl AggregatedKey {
	pub fn new(s: impl AsRef<str>) -> Self {
		AggregatedKey(strng::new(s))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for AggregatedKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl AsRef<str> for AggregatedKey {
	fn as_ref(&self) -> &str {
		&self.0
	}
}
