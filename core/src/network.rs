use async_trait::async_trait;
use mockall::automock;
use thiserror::Error;

use crate::types::PeerAddress;

pub mod p2p;
pub mod resolver;

#[derive(Debug, Error)]
pub enum Error {
	#[error("Bootstrap from {address} failed: {reason}")]
	Bootstrap { address: String, reason: String },
	#[error("Refresh failed: {0}")]
	Refresh(String),
	#[error("Network event loop is not running")]
	CommandChannelClosed,
	#[error("Network event loop dropped the response")]
	ResponseDropped,
	#[error("Network command failed: {0}")]
	Command(String),
}

impl Error {
	pub fn bootstrap(address: &PeerAddress, reason: impl ToString) -> Self {
		Error::Bootstrap {
			address: address.identity().to_string(),
			reason: reason.to_string(),
		}
	}
}

/// Notifications emitted by the discovery table, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
	PeerAdded(PeerAddress),
	PeerRemoved(PeerAddress),
	TransportError(String),
}

/// Operations the discovery orchestrator needs from the discovery table.
#[async_trait]
#[automock]
pub trait DiscoveryTransport {
	/// Contacts the address and starts exchanging routing information with it.
	async fn bootstrap(&self, address: PeerAddress) -> Result<(), Error>;
	/// Starts one maintenance pass over the routing table.
	async fn refresh(&self) -> Result<(), Error>;
	/// Releases listeners, connections and the event loop.
	async fn shutdown(&self) -> Result<(), Error>;
}
