//! Generated ADS wire types, built from `proto/discovery.proto` by
//! `build.rs` via `protox` + `tonic-prost-build`.

pub mod service {
	pub mod discovery {
		pub mod v3 {
			tonic::include_proto!("service.discovery.v3");
		}
	}
}

pub use service::discovery::v3;
