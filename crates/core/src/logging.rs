use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// A handle allowing the log level to be read and updated at runtime, wired
/// to the admin `/log_level` endpoint.
#[derive(Clone)]
pub struct LogHandle {
	reload: reload::Handle<EnvFilter, tracing_subscriber::Registry>,
	current: std::sync::Arc<parking_lot_lite::Level>,
}

mod parking_lot_lite {
	use std::sync::atomic::{AtomicU8, Ordering};

	/// Minimal atomic level cell; avoids pulling in a lock for a single byte.
	pub struct Level(AtomicU8);

	impl Level {
		pub fn new(initial: super::LevelName) -> Self {
			Self(AtomicU8::new(initial as u8))
		}
		pub fn store(&self, level: super::LevelName) {
			self.0.store(level as u8, Ordering::Relaxed);
		}
		pub fn load(&self) -> super::LevelName {
			super::LevelName::from_u8(self.0.load(Ordering::Relaxed))
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LevelName {
	Debug = 0,
	Info = 1,
	Warn = 2,
	Error = 3,
}

impl LevelName {
	fn from_u8(v: u8) -> Self {
		match v {
			0 => LevelName::Debug,
			2 => LevelName::Warn,
			3 => LevelName::Error,
			_ => LevelName::Info,
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"debug" => Some(LevelName::Debug),
			"info" => Some(LevelName::Info),
			"warn" => Some(LevelName::Warn),
			"error" => Some(LevelName::Error),
			_ => None,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			LevelName::Debug => "debug",
			LevelName::Info => "info",
			LevelName::Warn => "warn",
			LevelName::Error => "error",
		}
	}

	fn as_filter(self) -> LevelFilter {
		match self {
			LevelName::Debug => LevelFilter::DEBUG,
			LevelName::Info => LevelFilter::INFO,
			LevelName::Warn => LevelFilter::WARN,
			LevelName::Error => LevelFilter::ERROR,
		}
	}
}

impl LogHandle {
	pub fn get_level(&self) -> LevelName {
		self.current.load()
	}

	pub fn set_level(&self, level: LevelName) -> anyhow::Result<()> {
		let filter = EnvFilter::from_default_env().add_directive(level.as_filter().into());
		self
			.reload
			.modify(|f| *f = filter)
			.map_err(|e| anyhow::anyhow!("failed to reload log filter: {e}"))?;
		self.current.store(level);
		Ok(())
	}
}

/// Installs the global `tracing` subscriber (env-filter + JSON-capable
/// formatter, matching the teacher's `tracing-subscriber` feature set) and
/// returns a handle for runtime level changes.
pub fn init(initial_level: &str, json: bool) -> anyhow::Result<LogHandle> {
	let level = LevelName::parse(initial_level)
		.ok_or_else(|| anyhow::anyhow!("invalid log level: {initial_level}"))?;
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(level.as_str()));
	let (filter, reload_handle) = reload::Layer::new(filter);

	let registry = tracing_subscriber::registry().with(filter);
	if json {
		registry.with(fmt::layer().json()).try_init()
	} else {
		registry.with(fmt::layer()).try_init()
	}
	.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

	Ok(LogHandle {
		reload: reload_handle,
		current: std::sync::Arc::new(parking_lot_lite::Level::new(level)),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_known_levels() {
		assert_eq!(LevelName::parse("debug"), Some(LevelName::Debug));
		assert_eq!(LevelName::parse("bogus"), None);
	}
}
