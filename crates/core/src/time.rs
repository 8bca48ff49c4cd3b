use std::time::Duration;

/// Parses a Go-style duration string (e.g. `"15s"`, `"2m30s"`, `"250ms"`),
/// matching the syntax already used for durations elsewhere in the teacher's
/// config surface.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
	let nanos = go_parse_duration::parse_duration(s).map_err(|e| format!("{e:?}"))?;
	if nanos < 0 {
		return Err(format!("duration must not be negative: {s}"));
	}
	Ok(Duration::from_nanos(nanos as u64))
}

/// Renders a [`Duration`] back to the same human-readable syntax, for admin
/// dumps and config round-tripping.
pub fn format_duration(d: Duration) -> String {
	durationfmt::to_string(d)
}

pub mod serde_duration {
	use super::*;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&format_duration(*d))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(d)?;
		parse_duration(&raw).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_seconds() {
		let d = parse_duration("15s").unwrap();
		assert_eq!(d, Duration::from_secs(15));
	}

	#[test]
	fn rejects_negative() {
		assert!(parse_duration("-5s").is_err());
	}

	#[test]
	fn rejects_garbage() {
		assert!(parse_duration("not-a-duration").is_err());
	}
}
