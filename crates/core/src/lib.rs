pub mod config;
pub mod error;
pub mod key;
pub mod logging;
pub mod metrics;
pub mod strng;
pub mod time;

pub use error::ErrorKind;
pub use key::AggregatedKey;
pub use strng::Strng;

/// Glob-importable set of the names used pervasively across the workspace,
/// mirroring the teacher's `agent_core::prelude`.
pub mod prelude {
	pub use crate::error::ErrorKind;
	pub use crate::strng::{self, RichStrng, Strng};
	pub use tracing::{debug, error, info, instrument, trace, warn};
}
