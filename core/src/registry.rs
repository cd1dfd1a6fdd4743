//! Deduplicated set of discovered peers, kept in discovery order.
use std::{
	collections::HashMap,
	sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::types::{DiscoverySnapshot, PeerAddress, PeerIdentity};

#[derive(Default)]
struct Peers {
	by_identity: HashMap<PeerIdentity, PeerAddress>,
	order: Vec<PeerIdentity>,
}

/// Shared handle to the peers found so far.
///
/// Clones share the same storage. Only the discovery event path inserts,
/// everything else reads.
#[derive(Clone, Default)]
pub struct Registry {
	peers: Arc<RwLock<Peers>>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	fn read(&self) -> RwLockReadGuard<'_, Peers> {
		self.peers.read().unwrap_or_else(PoisonError::into_inner)
	}

	fn write(&self) -> RwLockWriteGuard<'_, Peers> {
		self.peers.write().unwrap_or_else(PoisonError::into_inner)
	}

	/// Inserts the peer unless its identity is already known.
	/// Returns `true` when the peer was new.
	pub fn insert(&self, peer: PeerAddress) -> bool {
		let identity = peer.identity();
		let mut peers = self.write();
		if peers.by_identity.contains_key(&identity) {
			return false;
		}
		peers.order.push(identity.clone());
		peers.by_identity.insert(identity, peer);
		true
	}

	pub fn len(&self) -> usize {
		self.read().order.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// All peers in the order they were first discovered.
	pub fn peers(&self) -> Vec<PeerAddress> {
		let peers = self.read();
		peers
			.order
			.iter()
			.filter_map(|identity| peers.by_identity.get(identity).cloned())
			.collect()
	}

	pub fn snapshot(&self, round: u32) -> DiscoverySnapshot {
		DiscoverySnapshot {
			count: self.len(),
			round,
		}
	}
}
