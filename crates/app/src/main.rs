mod downstream;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use prometheus_client::registry::Registry;
use relay_core::config::Bootstrap;
use relay_orchestrator::{Orchestrator, OrchestratorConfig};
use relay_xds::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
use relay_xds::OriginRoute;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "xds-relay", about = "Aggregating xDS relay", long_about = None)]
struct Args {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Start the relay process.
	Run {
		#[arg(long, value_name = "file")]
		config: PathBuf,
	},
	/// Parse and validate a bootstrap config and its aggregation rules, then exit.
	Validate {
		#[arg(long, value_name = "file")]
		config: PathBuf,
	},
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			match args.command {
				Command::Validate { config } => validate(config).await,
				Command::Run { config } => run(config).await,
			}
		})
}

async fn validate(config_path: PathBuf) -> anyhow::Result<()> {
	let bootstrap = Bootstrap::load(&config_path)?;
	relay_aggregation::AggregationRules::load(&bootstrap.aggregation_rules_path)?;
	println!("configuration is valid");
	Ok(())
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
	let bootstrap = Bootstrap::load(&config_path)?;
	let log_handle = Arc::new(relay_core::logging::init(&bootstrap.log_level, false)?);
	info!("starting xds-relay");

	let mut metrics_registry = Registry::default();
	let origins = bootstrap
		.origins
		.iter()
		.map(|o| OriginRoute { key_pattern: o.key_pattern.clone(), address: o.address.clone() })
		.collect();

	let orchestrator_config = OrchestratorConfig {
		cache: relay_cache::CacheConfig {
			ttl: bootstrap.cache.ttl,
			stale_serve_window: bootstrap.cache.stale_serve_window,
			shard_count: bootstrap.cache.shard_count,
			max_entries: bootstrap.cache.max_entries,
		},
		upstream: relay_xds::UpstreamManagerConfig {
			initial_backoff: bootstrap.upstream.initial_backoff,
			max_backoff: bootstrap.upstream.max_backoff,
			linger: bootstrap.upstream.linger,
			max_concurrent_subscriptions: bootstrap.upstream.max_concurrent_subscriptions,
			..Default::default()
		},
		sweep_interval: std::time::Duration::from_secs(10),
		channel_capacity: 16,
	};
	if bootstrap.upstream.propagate_nacks {
		tracing::warn!(
			"propagate_nacks is set, but a single upstream subscription is shared by every \
			 bound watch; a downstream NACK is always answered locally with the already-cached \
			 response rather than forwarded upstream as a rejection"
		);
	}

	let orchestrator = Arc::new(Orchestrator::new(&bootstrap.aggregation_rules_path, origins, orchestrator_config, &mut metrics_registry)?);

	let sweep_handle = {
		let orchestrator = orchestrator.clone();
		tokio::spawn(async move { orchestrator.run(std::time::Duration::from_secs(10)).await })
	};

	let (ready_tx, _ready_rx) = watch::channel(true);
	let bootstrap_dump = serde_yaml::to_string(&bootstrap).unwrap_or_else(|_| "<unable to dump bootstrap config>".to_string());
	let admin_router = relay_admin::router(orchestrator.clone(), log_handle.clone(), bootstrap_dump, ready_tx);
	let admin_listener = tokio::net::TcpListener::bind(bootstrap.admin.bind_address).await?;
	info!(address = %bootstrap.admin.bind_address, "admin surface listening");
	let admin_handle = tokio::spawn(async move { axum::serve(admin_listener, admin_router).await });

	let grpc_addr: std::net::SocketAddr = "0.0.0.0:18000".parse()?;
	info!(address = %grpc_addr, "ADS surface listening");
	let ads_service = AggregatedDiscoveryServiceServer::new(downstream::DownstreamService::new(orchestrator.clone()));

	tokio::select! {
		res = tonic::transport::Server::builder().add_service(ads_service).serve(grpc_addr) => res?,
		res = admin_handle => { res??; }
		res = sweep_handle => res?,
		_ = tokio::signal::ctrl_c() => {
			info!("received ctrl-c, shutting down");
			orchestrator.shutdown();
		}
	}
	Ok(())
}
