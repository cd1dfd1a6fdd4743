use clap::Parser;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use config::Config;
use peer_crawler_core::{
	discovery::{Discovery, DiscoveryOutcome},
	network::p2p,
	recorder::Recorder,
	shutdown::Controller,
	types::DiscoveryState,
	utils::{default_subscriber, install_panic_hooks, json_subscriber, spawn_in_span},
};
use std::sync::Arc;
use tracing::{info, span, Level};

mod config;

#[tokio::main]
pub async fn main() -> Result<()> {
	let shutdown = Controller::new();
	let opts = config::CliOpts::parse();
	let config = config::load(&opts)?;

	if config.log_format_json {
		tracing::subscriber::set_global_default(json_subscriber(config.log_level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(config.log_level))?;
	}

	install_panic_hooks(shutdown.clone())?;

	let recorder = Recorder::create(&config.output_path, &config.discovery.seeds)
		.wrap_err("Unable to prepare the output directory")?;
	info!("Recording discovered peers to {}", recorder.log_path().display());

	let span = span!(
		Level::INFO,
		"run",
		run_id = %recorder.run_id(),
		client_alias = config.client_alias
	);
	let _enter = config.log_format_json.then(|| span.enter());

	spawn_in_span(shutdown.on_user_signal("User signaled shutdown".to_string()));

	let result = spawn_in_span(shutdown.with_trigger(
		"Discovery finished".to_string(),
		run(config, recorder, shutdown.clone()),
	))
	.await?;

	let reason = shutdown.completed_shutdown().await;
	info!("Shutdown completed: {reason}");

	let outcome = result?;
	match outcome.state {
		DiscoveryState::Complete => Ok(()),
		state => Err(eyre!(
			"Discovery {state} after {} rounds with {} peers: {}",
			outcome.rounds,
			outcome.peers.len(),
			outcome.termination
		)),
	}
}

async fn run(
	config: Config,
	recorder: Recorder,
	shutdown: Controller<String>,
) -> Result<DiscoveryOutcome> {
	let version = clap::crate_version!();
	info!("Running Peer Crawler v{version}");
	info!("Using configuration: {config:?}");

	let (p2p_keypair, _) = p2p::identity(&config.libp2p)?;

	let (p2p_client, p2p_event_loop, transport_events) =
		p2p::init(config.libp2p.clone(), p2p_keypair, shutdown.clone())?;

	spawn_in_span(shutdown.with_cancel(p2p_event_loop.run()));

	p2p_client
		.start_listening(vec![config.libp2p.tcp_multiaddress()])
		.await
		.wrap_err("Listening on TCP not to fail.")?;
	info!("TCP listener started on port {}", config.libp2p.port);

	let discovery = Discovery::new(
		config.discovery,
		Arc::new(p2p_client),
		transport_events,
		recorder,
		shutdown,
	);
	let outcome = discovery.run().await?;

	info!(
		state = %outcome.state,
		rounds = outcome.rounds,
		peers = outcome.peers.len(),
		"Crawl finished: {}",
		outcome.termination
	);
	Ok(outcome)
}
