use crate::types::{duration_seconds_format, KademliaMode, SecretKey};
use color_eyre::{eyre::WrapErr, Result};
use libp2p::{kad, multiaddr::Protocol, Multiaddr, StreamProtocol};
use serde::{Deserialize, Serialize};
use std::{
	net::{IpAddr, Ipv4Addr},
	num::NonZeroUsize,
	time::Duration,
};

/// Identify configuration for libp2p identify protocol
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct IdentifyConfig {
	/// Protocol name/version to use for the identify protocol (default: "/ipfs/id/1.0.0")
	pub identify_protocol: String,
	/// Agent version advertised to remote peers (default: "peer-crawler/<version>")
	pub identify_agent_version: String,
	/// The delay between identification requests (default: 5 min)
	#[serde(with = "duration_seconds_format")]
	pub identify_interval: Duration,
}

impl Default for IdentifyConfig {
	fn default() -> Self {
		Self {
			identify_protocol: "/ipfs/id/1.0.0".to_string(),
			identify_agent_version: format!("peer-crawler/{}", env!("CARGO_PKG_VERSION")),
			identify_interval: Duration::from_secs(5 * 60),
		}
	}
}

/// Kademlia configuration
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct KademliaConfig {
	/// Kademlia protocol name spoken by the crawled network (default: "/ipfs/kad/1.0.0")
	pub kad_protocol_name: String,
	/// Sets the timeout for a single Kademlia query. (default: 10s).
	#[serde(with = "duration_seconds_format")]
	pub kad_query_timeout: Duration,
	/// Sets the allowed level of parallelism for iterative Kademlia queries. (default: 3).
	pub kad_query_parallelism: usize,
	/// Sets Kademlia mode (server/client, default client)
	pub operation_mode: KademliaMode,
	/// Sets the timeout duration after which a pending entry becomes eligible for insertion on a full bucket. (default: 60s)
	#[serde(with = "duration_seconds_format")]
	pub kbucket_pending_timeout: Duration,
}

impl Default for KademliaConfig {
	fn default() -> Self {
		Self {
			kad_protocol_name: "/ipfs/kad/1.0.0".to_string(),
			kad_query_timeout: Duration::from_secs(10),
			kad_query_parallelism: 3,
			operation_mode: KademliaMode::Client,
			kbucket_pending_timeout: Duration::from_secs(60),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LibP2PConfig {
	/// Secret key for libp2p keypair. Can be either set to `seed` or to `key`.
	/// If set to seed, keypair will be generated from that seed.
	/// If set to key, a valid ed25519 private key must be provided, else the crawler will fail.
	/// If `secret_key` is not set, random keypair will be used.
	pub secret_key: Option<SecretKey>,
	/// Local bind address (default: 0.0.0.0).
	pub listen_address: IpAddr,
	/// P2P TCP listener port (default: 37000).
	pub port: u16,
	/// Kademlia configuration
	#[serde(flatten)]
	pub kademlia: KademliaConfig,
	/// Identify configuration
	#[serde(flatten)]
	pub identify: IdentifyConfig,
	/// Sets the amount of time to keep connections alive when they're idle. (default: 30s).
	#[serde(with = "duration_seconds_format")]
	pub connection_idle_timeout: Duration,
	/// Upper bound for dialing a bootstrap address. (default: 10s).
	#[serde(with = "duration_seconds_format")]
	pub dial_timeout: Duration,
}

impl Default for LibP2PConfig {
	fn default() -> Self {
		Self {
			secret_key: None,
			listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			port: 37000,
			kademlia: Default::default(),
			identify: Default::default(),
			connection_idle_timeout: Duration::from_secs(30),
			dial_timeout: Duration::from_secs(10),
		}
	}
}

impl LibP2PConfig {
	pub fn tcp_multiaddress(&self) -> Multiaddr {
		Multiaddr::from(self.listen_address).with(Protocol::Tcp(self.port))
	}

	pub fn protocol_name(&self) -> Result<StreamProtocol> {
		StreamProtocol::try_from_owned(self.kademlia.kad_protocol_name.clone())
			.wrap_err("Invalid Kademlia protocol name")
	}
}

pub fn identify_config(
	cfg: &LibP2PConfig,
	public_key: libp2p::identity::PublicKey,
) -> libp2p::identify::Config {
	libp2p::identify::Config::new(cfg.identify.identify_protocol.clone(), public_key)
		.with_agent_version(cfg.identify.identify_agent_version.clone())
		.with_interval(cfg.identify.identify_interval)
}

pub fn kad_config(cfg: &LibP2PConfig) -> Result<kad::Config> {
	let mut kad_cfg = kad::Config::new(cfg.protocol_name()?);
	kad_cfg
		.set_query_timeout(cfg.kademlia.kad_query_timeout)
		// Refresh passes are driven by the discovery orchestrator
		.set_periodic_bootstrap_interval(None)
		.set_kbucket_pending_timeout(cfg.kademlia.kbucket_pending_timeout);
	if let Some(parallelism) = NonZeroUsize::new(cfg.kademlia.kad_query_parallelism) {
		kad_cfg.set_parallelism(parallelism);
	}
	Ok(kad_cfg)
}
