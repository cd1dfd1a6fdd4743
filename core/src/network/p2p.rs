use color_eyre::{eyre::WrapErr, Report, Result};
use configuration::{identify_config, kad_config, LibP2PConfig};
use libp2p::{
	identify,
	identity::{self, Keypair},
	kad::{self, store::MemoryStore},
	multiaddr::Protocol,
	noise, ping,
	swarm::NetworkBehaviour,
	tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use multihash::{self, Hasher};
use std::{borrow::Cow, net::IpAddr};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::info;

mod client;
pub mod configuration;
mod event_loop;

use super::TransportEvent;
use crate::{
	shutdown::Controller,
	types::{PeerAddress, SecretKey},
};
pub use client::Client;
pub use event_loop::EventLoop;

type Command = Box<dyn FnOnce(&mut EventLoop) -> Result<(), Report> + Send>;

// Behaviour struct is used to derive delegated Libp2p behaviour implementation
#[derive(NetworkBehaviour)]
pub struct Behaviour {
	kademlia: kad::Behaviour<MemoryStore>,
	identify: identify::Behaviour,
	ping: ping::Behaviour,
}

fn generate_config(config: libp2p::swarm::Config, cfg: &LibP2PConfig) -> libp2p::swarm::Config {
	config.with_idle_connection_timeout(cfg.connection_idle_timeout)
}

pub fn init(
	cfg: LibP2PConfig,
	id_keys: Keypair,
	shutdown: Controller<String>,
) -> Result<(Client, EventLoop, UnboundedReceiver<TransportEvent>)> {
	// create sender channel for P2P event loop commands
	let (command_sender, command_receiver) = mpsc::unbounded_channel();
	let client = Client::new(command_sender, cfg.dial_timeout);
	let swarm = build_swarm(&cfg, &id_keys).wrap_err("Unable to build swarm")?;
	let (event_sender, event_receiver) = mpsc::unbounded_channel();
	let event_loop = EventLoop::new(swarm, command_receiver, event_sender, shutdown);

	Ok((client, event_loop, event_receiver))
}

fn build_swarm(cfg: &LibP2PConfig, id_keys: &Keypair) -> Result<Swarm<Behaviour>> {
	let identify_cfg = identify_config(cfg, id_keys.public());
	let kad_cfg = kad_config(cfg)?;

	let behaviour = |key: &identity::Keypair| {
		let local_peer_id = key.public().to_peer_id();
		Behaviour {
			ping: ping::Behaviour::new(ping::Config::new()),
			identify: identify::Behaviour::new(identify_cfg),
			kademlia: kad::Behaviour::with_config(
				local_peer_id,
				MemoryStore::new(local_peer_id),
				kad_cfg,
			),
		}
	};

	let mut swarm = SwarmBuilder::with_existing_identity(id_keys.clone())
		.with_tokio()
		.with_tcp(
			tcp::Config::default().nodelay(true),
			noise::Config::new,
			yamux::Config::default,
		)?
		.with_dns()?
		.with_behaviour(behaviour)?
		.with_swarm_config(|c| generate_config(c, cfg))
		.build();

	info!("Local peerID: {}", swarm.local_peer_id());

	// Fixed mode, the crawler does not advertise itself unless configured to
	swarm
		.behaviour_mut()
		.kademlia
		.set_mode(Some(cfg.kademlia.operation_mode.into()));

	Ok(swarm)
}

// Keypair function creates identity Keypair for a local node.
// From such generated keypair it derives multihash identifier of the local peer.
fn keypair(secret_key: &SecretKey) -> Result<identity::Keypair> {
	let keypair = match secret_key {
		// If seed is provided, generate secret key from seed
		SecretKey::Seed { seed } => {
			let seed_digest = multihash::Sha3_256::digest(seed.as_bytes());
			identity::Keypair::ed25519_from_bytes(seed_digest)
				.wrap_err("error generating secret key from seed")?
		},
		// Import secret key if provided
		SecretKey::Key { key } => {
			let mut decoded_key = [0u8; 32];
			hex::decode_to_slice(key.clone().into_bytes(), &mut decoded_key)
				.wrap_err("error decoding secret key from config")?;
			identity::Keypair::ed25519_from_bytes(decoded_key)
				.wrap_err("error importing secret key")?
		},
	};
	Ok(keypair)
}

pub fn identity(cfg: &LibP2PConfig) -> Result<(identity::Keypair, PeerId)> {
	let keypair = match cfg.secret_key.as_ref() {
		Some(secret_key) => keypair(secret_key)?,
		None => identity::Keypair::generate_ed25519(),
	};
	let peer_id = PeerId::from(keypair.public());
	Ok((keypair, peer_id))
}

/// Dialable address of a peer: `/ip4|ip6|dns/<host>/tcp/<discovery_port>`.
pub fn peer_multiaddr(address: &PeerAddress) -> Multiaddr {
	let host = match address.host.parse::<IpAddr>() {
		Ok(IpAddr::V4(ip)) => Protocol::Ip4(ip),
		Ok(IpAddr::V6(ip)) => Protocol::Ip6(ip),
		Err(_) => Protocol::Dns(Cow::Owned(address.host.clone())),
	};
	Multiaddr::empty()
		.with(host)
		.with(Protocol::Tcp(address.discovery_port))
}

/// Extracts the host and the first TCP port of a multiaddress.
pub fn peer_address(address: &Multiaddr) -> Option<PeerAddress> {
	let mut host = None;
	let mut port = None;
	for protocol in address.iter() {
		match protocol {
			Protocol::Ip4(ip) if host.is_none() => host = Some(ip.to_string()),
			Protocol::Ip6(ip) if host.is_none() => host = Some(ip.to_string()),
			Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name)
				if host.is_none() =>
			{
				host = Some(name.to_string())
			},
			Protocol::Tcp(tcp_port) if port.is_none() => port = Some(tcp_port),
			_ => continue,
		}
	}
	let port = port?;
	Some(PeerAddress::new(host?, port, port))
}

pub fn is_localhost(addr: &Multiaddr) -> bool {
	addr.iter().any(|protocol| match protocol {
		Protocol::Ip4(ip) => ip.is_loopback(),
		Protocol::Ip6(ip) => ip.is_loopback(),
		Protocol::Dns(host)
		| Protocol::Dns4(host)
		| Protocol::Dns6(host)
		| Protocol::Dnsaddr(host) => host.eq_ignore_ascii_case("localhost"),
		_ => false,
	})
}

/// Picks the address reported for a routing table entry,
/// preferring addresses that are reachable from other hosts.
pub fn routable_address<'a>(addresses: impl Iterator<Item = &'a Multiaddr>) -> Option<PeerAddress> {
	let mut loopback = None;
	for address in addresses {
		let Some(peer) = peer_address(address) else {
			continue;
		};
		if !is_localhost(address) {
			return Some(peer);
		}
		loopback.get_or_insert(peer);
	}
	loopback
}
