//! Turns seed references into concrete peer addresses.
use async_trait::async_trait;
use libp2p::{multiaddr::Protocol, Multiaddr};
use std::{
	net::{IpAddr, SocketAddr},
	str::FromStr,
	time::Duration,
};
use thiserror::Error;
use tokio::{net::lookup_host, time::timeout};
use tracing::{debug, warn};

use crate::types::PeerAddress;

const ENODE_PREFIX: &str = "enode://";
const MULTIADDR_PREFIX: &str = "/";
const NODE_ID_HEX_LENGTH: usize = 128;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
	#[error("Malformed node reference '{reference}': {reason}")]
	MalformedReference { reference: String, reason: String },
	#[error("Unable to resolve host '{host}': {reason}")]
	Resolution { host: String, reason: String },
}

fn malformed(reference: &str, reason: impl Into<String>) -> Error {
	Error::MalformedReference {
		reference: reference.to_string(),
		reason: reason.into(),
	}
}

/// Parsed, but not yet resolved, node reference.
#[derive(Debug, PartialEq)]
struct NodeReference {
	host: String,
	discovery_port: u16,
	transport_port: u16,
}

// enode://<node-id>@<host>:<tcp-port>[?discport=<udp-port>]
fn parse_enode(reference: &str) -> Result<NodeReference, Error> {
	let body = &reference[ENODE_PREFIX.len()..];
	let Some((node_id, endpoint)) = body.split_once('@') else {
		return Err(malformed(reference, "missing '@' separator"));
	};

	if node_id.len() != NODE_ID_HEX_LENGTH || hex::decode(node_id).is_err() {
		return Err(malformed(reference, "node id is not a 64 byte hex string"));
	}

	let (endpoint, query) = match endpoint.split_once('?') {
		Some((endpoint, query)) => (endpoint, Some(query)),
		None => (endpoint, None),
	};

	let Some((host, port)) = endpoint.rsplit_once(':') else {
		return Err(malformed(reference, "missing port"));
	};
	let host = host.trim_start_matches('[').trim_end_matches(']');
	if host.is_empty() {
		return Err(malformed(reference, "missing host"));
	}
	// The Kademlia table is reached over TCP, `discport` is carried along as the UDP port
	let discovery_port =
		u16::from_str(port).map_err(|error| malformed(reference, format!("port: {error}")))?;

	let mut transport_port = discovery_port;
	for (key, value) in query.into_iter().flat_map(|q| q.split('&')).filter_map(|p| p.split_once('=')) {
		if key == "discport" {
			transport_port = u16::from_str(value)
				.map_err(|error| malformed(reference, format!("discport: {error}")))?;
		}
	}

	Ok(NodeReference {
		host: host.to_string(),
		discovery_port,
		transport_port,
	})
}

fn parse_multiaddr(reference: &str) -> Result<NodeReference, Error> {
	let address =
		Multiaddr::from_str(reference).map_err(|error| malformed(reference, error.to_string()))?;

	let mut host = None;
	let mut tcp_port = None;
	let mut udp_port = None;
	for protocol in address.iter() {
		match protocol {
			Protocol::Ip4(ip) => host = host.or(Some(ip.to_string())),
			Protocol::Ip6(ip) => host = host.or(Some(ip.to_string())),
			Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
				host = host.or(Some(name.to_string()))
			},
			Protocol::Tcp(port) => tcp_port = tcp_port.or(Some(port)),
			Protocol::Udp(port) => udp_port = udp_port.or(Some(port)),
			_ => {},
		}
	}

	let Some(host) = host else {
		return Err(malformed(reference, "missing ip4, ip6 or dns component"));
	};
	let Some(discovery_port) = tcp_port else {
		return Err(malformed(reference, "missing tcp port"));
	};

	Ok(NodeReference {
		host,
		discovery_port,
		transport_port: udp_port.unwrap_or(discovery_port),
	})
}

fn parse(reference: &str) -> Result<NodeReference, Error> {
	let reference = reference.trim();
	if reference.starts_with(ENODE_PREFIX) {
		parse_enode(reference)
	} else if reference.starts_with(MULTIADDR_PREFIX) {
		parse_multiaddr(reference)
	} else {
		Err(malformed(reference, "unrecognized format"))
	}
}

/// Turns a node reference into a dialable peer address.
#[async_trait]
pub trait NodeResolver {
	async fn resolve(&self, reference: &str) -> Result<PeerAddress, Error>;
}

#[derive(Clone, Debug)]
pub struct Resolver {
	timeout: Duration,
}

impl Resolver {
	pub fn new(timeout: Duration) -> Self {
		Self { timeout }
	}

	async fn lookup(&self, host: &str, port: u16) -> Result<IpAddr, Error> {
		if let Ok(ip) = IpAddr::from_str(host) {
			return Ok(ip);
		}

		let resolution_error = |reason: String| Error::Resolution {
			host: host.to_string(),
			reason,
		};

		let addresses: Vec<SocketAddr> = timeout(self.timeout, lookup_host((host, port)))
			.await
			.map_err(|_| resolution_error(format!("lookup timed out after {:?}", self.timeout)))?
			.map_err(|error| resolution_error(error.to_string()))?
			.collect();

		let ip = addresses
			.iter()
			.find(|address| address.is_ipv4())
			.or(addresses.first())
			.map(SocketAddr::ip)
			.ok_or_else(|| resolution_error("no addresses returned".to_string()))?;

		debug!(host, %ip, "Resolved hostname");
		Ok(ip)
	}
}

#[async_trait]
impl NodeResolver for Resolver {
	/// Parses the reference and resolves its host to an IP address.
	///
	/// Hostnames that cannot be resolved are kept as-is, only malformed
	/// references are reported as errors.
	async fn resolve(&self, reference: &str) -> Result<PeerAddress, Error> {
		let node = parse(reference)?;
		let host = match self.lookup(&node.host, node.discovery_port).await {
			Ok(ip) => ip.to_string(),
			Err(error) => {
				warn!("{error}, falling back to the literal hostname");
				node.host
			},
		};

		Ok(PeerAddress::new(host, node.discovery_port, node.transport_port))
	}
}
