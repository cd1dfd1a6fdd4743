//! Shared discovery structs and enums.
use color_eyre::{eyre::eyre, Report};
use libp2p::kad::Mode as KadMode;
use serde::{Deserialize, Serialize};
use std::{
	fmt::{self, Display, Formatter},
	hash::{Hash, Hasher},
	net::IpAddr,
	time::Duration,
};
use strum::Display as StrumDisplay;

/// Address record of a discovered or seeded peer.
///
/// Two records describe the same peer when `host` and `discovery_port` match,
/// `transport_port` is carried along for information only.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerAddress {
	pub host: String,
	pub discovery_port: u16,
	pub transport_port: u16,
}

impl PeerAddress {
	pub fn new(host: impl Into<String>, discovery_port: u16, transport_port: u16) -> Self {
		Self {
			host: host.into(),
			discovery_port,
			transport_port,
		}
	}

	pub fn identity(&self) -> PeerIdentity {
		match self.host.parse::<IpAddr>() {
			Ok(IpAddr::V6(ip)) => PeerIdentity(format!("[{ip}]:{}", self.discovery_port)),
			_ => PeerIdentity(format!("{}:{}", self.host, self.discovery_port)),
		}
	}

	/// Returns `true` if host is an IP literal (as opposed to unresolved hostname)
	pub fn is_ip(&self) -> bool {
		self.host.parse::<IpAddr>().is_ok()
	}
}

impl PartialEq for PeerAddress {
	fn eq(&self, other: &Self) -> bool {
		self.host == other.host && self.discovery_port == other.discovery_port
	}
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.host.hash(state);
		self.discovery_port.hash(state);
	}
}

impl Display for PeerAddress {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{} (transport {})", self.identity(), self.transport_port)
	}
}

/// Registry key of a peer, formatted as `host:discovery_port`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity(String);

impl Display for PeerIdentity {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiscoveryState {
	Running,
	Complete,
	Stopped,
}

/// Registry size observed right before a refresh round is evaluated.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverySnapshot {
	pub count: usize,
	pub round: u32,
}

/// Reason a discovery run ended.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
	MaxRounds,
	MaxNodes,
	Stagnation,
	Timeout,
	Shutdown(String),
	TransportClosed,
}

impl Termination {
	pub fn state(&self) -> DiscoveryState {
		match self {
			Termination::MaxRounds | Termination::MaxNodes | Termination::Stagnation => {
				DiscoveryState::Complete
			},
			Termination::Timeout | Termination::Shutdown(_) | Termination::TransportClosed => {
				DiscoveryState::Stopped
			},
		}
	}
}

impl Display for Termination {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			Termination::MaxRounds => write!(f, "maximum number of rounds reached"),
			Termination::MaxNodes => write!(f, "maximum number of nodes reached"),
			Termination::Stagnation => write!(f, "no new peers since the last round"),
			Termination::Timeout => write!(f, "timed out"),
			Termination::Shutdown(reason) => write!(f, "shut down: {reason}"),
			Termination::TransportClosed => write!(f, "transport event stream closed"),
		}
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "String")]
pub enum KademliaMode {
	Client,
	Server,
}

impl From<KademliaMode> for KadMode {
	fn from(value: KademliaMode) -> Self {
		match value {
			KademliaMode::Client => KadMode::Client,
			KademliaMode::Server => KadMode::Server,
		}
	}
}

impl Display for KademliaMode {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			KademliaMode::Client => write!(f, "client"),
			KademliaMode::Server => write!(f, "server"),
		}
	}
}

impl TryFrom<String> for KademliaMode {
	type Error = Report;

	fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
		match value.to_lowercase().as_str() {
			"client" => Ok(KademliaMode::Client),
			"server" => Ok(KademliaMode::Server),
			_ => Err(eyre!(
				"Wrong Kademlia mode. Expecting 'client' or 'server'."
			)),
		}
	}
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum SecretKey {
	Seed { seed: String },
	Key { key: String },
}

pub mod tracing_level_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&level.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}

pub mod duration_seconds_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_secs())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(value))
	}
}
