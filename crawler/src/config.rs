use std::{fs, time::Duration};

use clap::{command, Parser};
use color_eyre::{eyre::WrapErr, Result};
use peer_crawler_core::{
	discovery::DiscoveryConfig,
	network::p2p::configuration::LibP2PConfig,
	types::{tracing_level_format, SecretKey},
};
use serde::{Deserialize, Serialize};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(version)]
pub struct CliOpts {
	/// Sets path to the configuration file.
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<String>,
	/// Seed node reference (enode URL or multiaddress), can be repeated.
	#[arg(long = "seed", value_name = "NODE")]
	pub seeds: Vec<String>,
	/// Sets the P2P listener port.
	#[arg(short, long)]
	pub port: Option<u16>,
	/// Seconds between refresh rounds.
	#[arg(long, value_name = "SECONDS")]
	pub refresh_interval: Option<u64>,
	/// Maximum number of refresh rounds.
	#[arg(long)]
	pub max_rounds: Option<u32>,
	/// Minimum number of refresh rounds before stopping on no progress.
	#[arg(long)]
	pub min_rounds: Option<u32>,
	/// Stop after this many peers are found (0 for unlimited).
	#[arg(long)]
	pub max_nodes: Option<usize>,
	/// Overall run timeout in seconds.
	#[arg(long, value_name = "SECONDS")]
	pub timeout: Option<u64>,
	/// Output directory for the peer log and the summary.
	#[arg(short, long, value_name = "DIR")]
	pub output: Option<String>,
	/// Sets verbosity level.
	#[arg(long)]
	pub verbosity: Option<Level>,
	/// Sets logs format to JSON.
	#[arg(long)]
	pub logs_json: bool,
	/// Seed phrase for the P2P identity.
	#[arg(long)]
	pub seed_phrase: Option<String>,
	/// Hex encoded ed25519 private key for the P2P identity.
	#[arg(long)]
	pub private_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Log level.
	#[serde(with = "tracing_level_format")]
	pub log_level: Level,
	/// Log format: JSON for `true`, plain text for `false`.
	pub log_format_json: bool,
	/// Client alias for use in logs.
	pub client_alias: String,
	/// Directory receiving `peers.ndjson` and `summary.json` (default: "crawl_output").
	pub output_path: String,
	#[serde(flatten)]
	pub discovery: DiscoveryConfig,
	#[serde(flatten)]
	pub libp2p: LibP2PConfig,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			log_level: Level::INFO,
			log_format_json: false,
			client_alias: "crawler".to_string(),
			output_path: "crawl_output".to_string(),
			discovery: Default::default(),
			libp2p: Default::default(),
		}
	}
}

pub fn load(opts: &CliOpts) -> Result<Config> {
	let mut config = match &opts.config {
		Some(path) => {
			fs::metadata(path).wrap_err_with(|| format!("Configuration file {path} not found"))?;
			confy::load_path(path).wrap_err_with(|| format!("Invalid configuration file {path}"))?
		},
		None => Config::default(),
	};

	config.log_level = opts.verbosity.unwrap_or(config.log_level);
	config.log_format_json = opts.logs_json || config.log_format_json;

	if !opts.seeds.is_empty() {
		config.discovery.seeds = opts.seeds.clone();
	}
	if let Some(port) = opts.port {
		config.libp2p.port = port;
	}
	if let Some(seconds) = opts.refresh_interval {
		config.discovery.refresh_interval = Duration::from_secs(seconds);
	}
	if let Some(max_rounds) = opts.max_rounds {
		config.discovery.max_rounds = max_rounds;
	}
	if let Some(min_rounds) = opts.min_rounds {
		config.discovery.min_rounds = min_rounds;
	}
	if let Some(max_nodes) = opts.max_nodes {
		config.discovery.max_nodes = max_nodes;
	}
	if let Some(seconds) = opts.timeout {
		config.discovery.timeout = Duration::from_secs(seconds);
	}
	if let Some(output) = &opts.output {
		config.output_path = output.clone();
	}
	if let Some(seed) = &opts.seed_phrase {
		config.libp2p.secret_key = Some(SecretKey::Seed { seed: seed.clone() });
	}
	if let Some(key) = &opts.private_key {
		config.libp2p.secret_key = Some(SecretKey::Key { key: key.clone() });
	}

	config.discovery.validate()?;

	Ok(config)
}
