use futures::StreamExt;
use libp2p::{
	identify::{self, Info},
	kad::{self, BootstrapOk, GetClosestPeersError, GetClosestPeersOk, QueryResult},
	ping,
	swarm::{ConnectionId, SwarmEvent},
	Multiaddr, PeerId, Swarm,
};
use std::{collections::HashMap, fmt::Display};
use tokio::sync::{
	mpsc::{UnboundedReceiver, UnboundedSender},
	oneshot,
};
use tracing::{debug, info, trace, warn};

use super::{is_localhost, routable_address, Behaviour, BehaviourEvent, Command};
use crate::{
	network::{Error, TransportEvent},
	shutdown::Controller,
	types::PeerAddress,
};

type PendingDials = HashMap<ConnectionId, oneshot::Sender<Result<PeerId, Error>>>;

/// Translates a routing table update into transport events.
///
/// An evicted peer is reported only if it was announced before, a new peer
/// only if it has an address with a TCP port.
fn routing_events<'a>(
	peer: PeerId,
	is_new_peer: bool,
	addresses: impl Iterator<Item = &'a Multiaddr>,
	old_peer: Option<PeerId>,
	known_peers: &mut HashMap<PeerId, PeerAddress>,
) -> Vec<TransportEvent> {
	let mut events = vec![];
	if let Some(removed) = old_peer.and_then(|old| known_peers.remove(&old)) {
		events.push(TransportEvent::PeerRemoved(removed));
	}
	if !is_new_peer {
		return events;
	}
	match routable_address(addresses) {
		Some(address) => {
			known_peers.insert(peer, address.clone());
			events.push(TransportEvent::PeerAdded(address));
		},
		None => debug!("Peer {peer} has no TCP address, skipping"),
	}
	events
}

/// Completes the dial started on this connection, if any. Returns `true` when one was waiting.
fn resolve_dial(
	pending_dials: &mut PendingDials,
	connection_id: ConnectionId,
	result: Result<PeerId, Error>,
) -> bool {
	match pending_dials.remove(&connection_id) {
		Some(sender) => {
			_ = sender.send(result);
			true
		},
		None => false,
	}
}

/// Fails the pending dial of this connection and builds the matching transport event.
fn connection_failed(
	pending_dials: &mut PendingDials,
	connection_id: ConnectionId,
	peer_id: Option<PeerId>,
	error: impl Display,
) -> TransportEvent {
	let message = match peer_id {
		Some(peer_id) => format!("Outgoing connection to {peer_id} failed: {error}"),
		None => format!("Outgoing connection failed: {error}"),
	};
	resolve_dial(
		pending_dials,
		connection_id,
		Err(Error::Command(message.clone())),
	);
	TransportEvent::TransportError(message)
}

pub struct EventLoop {
	pub swarm: Swarm<Behaviour>,
	command_receiver: UnboundedReceiver<Command>,
	event_sender: UnboundedSender<TransportEvent>,
	// Tracking dials started without a known peer ID
	pub(crate) pending_dials: PendingDials,
	// Address reported for every peer announced as added
	known_peers: HashMap<PeerId, PeerAddress>,
	stop_requested: bool,
	shutdown: Controller<String>,
}

impl EventLoop {
	pub(crate) fn new(
		swarm: Swarm<Behaviour>,
		command_receiver: UnboundedReceiver<Command>,
		event_sender: UnboundedSender<TransportEvent>,
		shutdown: Controller<String>,
	) -> Self {
		Self {
			swarm,
			command_receiver,
			event_sender,
			pending_dials: Default::default(),
			known_peers: Default::default(),
			stop_requested: false,
			shutdown,
		}
	}

	/// Requests the loop to exit once the current command is handled.
	pub(crate) fn stop(&mut self) {
		self.disconnect_peers();
		self.stop_requested = true;
	}

	pub async fn run(mut self) {
		// shutdown will wait as long as this token is not dropped
		let Ok(_delay_token) = self.shutdown.delay_token() else {
			info!("Shutdown already triggered, network event loop not started");
			return;
		};

		loop {
			tokio::select! {
				Some(event) = self.swarm.next() => self.handle_event(event),
				command = self.command_receiver.recv() => match command {
					Some(command) => {
						if let Err(error) = command(&mut self) {
							warn!("Network command failed: {error:#}");
						}
						if self.stop_requested {
							info!("Transport shut down, exiting the network event loop");
							break;
						}
					},
					None => {
						warn!("Command channel closed, exiting the network event loop");
						break;
					},
				},
				// if the shutdown was triggered,
				// break the loop immediately, proceed to the cleanup phase
				_ = self.shutdown.triggered_shutdown() => {
					info!("Shutdown triggered, exiting the network event loop");
					break;
				}
			}
		}
		self.disconnect_peers();
	}

	fn disconnect_peers(&mut self) {
		let connected_peers: Vec<PeerId> = self.swarm.connected_peers().cloned().collect();
		// close all active connections with other peers
		for peer in connected_peers {
			_ = self.swarm.disconnect_peer_id(peer);
		}
	}

	fn emit(&self, event: TransportEvent) {
		if self.event_sender.send(event).is_err() {
			trace!("Transport event receiver dropped");
		}
	}

	fn handle_kademlia_event(&mut self, event: kad::Event) {
		match event {
			kad::Event::RoutingUpdated {
				peer,
				is_new_peer,
				addresses,
				old_peer,
				..
			} => {
				trace!("Routing updated. Peer: {peer:?}. is_new_peer: {is_new_peer:?}. Addresses: {addresses:#?}. Old peer: {old_peer:#?}");
				let events = routing_events(
					peer,
					is_new_peer,
					addresses.iter(),
					old_peer,
					&mut self.known_peers,
				);
				for event in events {
					self.emit(event);
				}
			},
			kad::Event::UnroutablePeer { peer } => {
				trace!("UnroutablePeer. Peer: {peer:?}");
			},
			kad::Event::OutboundQueryProgressed { result, .. } => match result {
				QueryResult::GetClosestPeers(Ok(GetClosestPeersOk { key, peers })) => {
					debug!(
						"Closest peers query for {:?} returned {} peers",
						PeerId::from_bytes(&key).ok(),
						peers.len()
					);
				},
				QueryResult::GetClosestPeers(Err(GetClosestPeersError::Timeout { peers, .. })) => {
					debug!("Closest peers query timed out with {} peers", peers.len());
				},
				QueryResult::Bootstrap(Ok(BootstrapOk {
					peer,
					num_remaining,
				})) => {
					trace!("BootstrapOK event. PeerID: {peer:?}. Num remaining: {num_remaining:?}.");
					if num_remaining == 0 {
						debug!("Refresh pass completed.");
					}
				},
				QueryResult::Bootstrap(Err(error)) => {
					debug!("Refresh pass error: {error:?}.");
				},
				_ => {},
			},
			_ => {},
		}
	}

	fn handle_identify_event(&mut self, event: identify::Event) {
		let identify::Event::Received {
			peer_id,
			info: Info {
				listen_addrs,
				protocols,
				agent_version,
				..
			},
			..
		} = event
		else {
			return;
		};
		trace!("Identity Received from: {peer_id:?} on listen address: {listen_addrs:?}");

		let kademlia = &mut self.swarm.behaviour_mut().kademlia;
		let speaks_protocol = kademlia
			.protocol_names()
			.first()
			.is_some_and(|protocol| protocols.contains(protocol));
		if speaks_protocol {
			listen_addrs
				.into_iter()
				// Filter out the loopback addresses
				.filter(|addr| !is_localhost(addr))
				.for_each(|addr| {
					trace!("Adding peer {peer_id} to routing table.");
					kademlia.add_address(&peer_id, addr);
				});
		} else {
			debug!("Removing peer from routing table. Peer: {peer_id}. Agent: {agent_version}");
			kademlia.remove_peer(&peer_id);
		}
	}

	#[tracing::instrument(level = "trace", skip(self))]
	fn handle_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
		match event {
			SwarmEvent::Behaviour(BehaviourEvent::Kademlia(event)) => {
				self.handle_kademlia_event(event)
			},
			SwarmEvent::Behaviour(BehaviourEvent::Identify(event)) => {
				self.handle_identify_event(event)
			},
			SwarmEvent::Behaviour(BehaviourEvent::Ping(ping::Event { peer, result, .. })) => {
				if let Ok(rtt) = result {
					trace!("Ping to {peer} took {rtt:?}");
				}
			},
			SwarmEvent::NewListenAddr { address, .. } => {
				debug!("Local node is listening on {address:?}");
			},
			SwarmEvent::ConnectionEstablished {
				peer_id,
				connection_id,
				..
			} => {
				// Notify the dials we're waiting on that we've connected successfully
				if resolve_dial(&mut self.pending_dials, connection_id, Ok(peer_id)) {
					trace!("Dial on {connection_id:?} reached {peer_id}");
				}
			},
			SwarmEvent::OutgoingConnectionError {
				connection_id,
				peer_id,
				error,
			} => {
				let event =
					connection_failed(&mut self.pending_dials, connection_id, peer_id, error);
				self.emit(event);
			},
			SwarmEvent::ConnectionClosed {
				peer_id,
				num_established,
				cause,
				..
			} => {
				trace!("Connection closed. PeerID: {peer_id:?}. Num established: {num_established:?}. Cause: {cause:?}");
			},
			_ => {},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use libp2p::identity::Keypair;
	use test_case::test_case;

	enum Evicted {
		Nobody,
		Announced,
		Unannounced,
	}

	fn random_peer() -> PeerId {
		Keypair::generate_ed25519().public().to_peer_id()
	}

	fn added(host: &str) -> TransportEvent {
		TransportEvent::PeerAdded(PeerAddress::new(host, 30303, 30303))
	}

	fn removed(host: &str) -> TransportEvent {
		TransportEvent::PeerRemoved(PeerAddress::new(host, 30303, 30303))
	}

	#[test_case(true, &["/ip4/10.0.0.7/tcp/30303"], Evicted::Nobody => vec![added("10.0.0.7")] ; "new peer")]
	#[test_case(true, &["/ip4/127.0.0.1/tcp/30303", "/ip4/10.0.0.7/tcp/30303"], Evicted::Nobody => vec![added("10.0.0.7")] ; "loopback skipped")]
	#[test_case(true, &["/ip4/127.0.0.1/tcp/30303"], Evicted::Nobody => vec![added("127.0.0.1")] ; "loopback only")]
	#[test_case(true, &["/ip4/10.0.0.7/udp/30303/quic-v1"], Evicted::Nobody => Vec::<TransportEvent>::new() ; "no TCP address")]
	#[test_case(false, &["/ip4/10.0.0.7/tcp/30303"], Evicted::Nobody => Vec::<TransportEvent>::new() ; "known peer")]
	#[test_case(true, &["/ip4/10.0.0.7/tcp/30303"], Evicted::Announced => vec![removed("10.0.0.9"), added("10.0.0.7")] ; "announced peer evicted")]
	#[test_case(true, &["/ip4/10.0.0.7/tcp/30303"], Evicted::Unannounced => vec![added("10.0.0.7")] ; "unannounced peer evicted")]
	#[test_case(false, &[], Evicted::Announced => vec![removed("10.0.0.9")] ; "eviction without new peer")]
	fn test_routing_events(
		is_new_peer: bool,
		addresses: &[&str],
		evicted: Evicted,
	) -> Vec<TransportEvent> {
		let addresses: Vec<Multiaddr> = addresses.iter().map(|a| a.parse().unwrap()).collect();
		let old = random_peer();
		let mut known_peers = HashMap::new();
		if matches!(evicted, Evicted::Announced) {
			known_peers.insert(old, PeerAddress::new("10.0.0.9", 30303, 30303));
		}
		let old_peer = (!matches!(evicted, Evicted::Nobody)).then_some(old);

		let events = routing_events(
			random_peer(),
			is_new_peer,
			addresses.iter(),
			old_peer,
			&mut known_peers,
		);
		assert!(!known_peers.contains_key(&old));
		events
	}

	#[test]
	fn test_added_peer_is_reported_when_evicted() {
		let mut known_peers = HashMap::new();
		let first = random_peer();
		let address: Multiaddr = "/ip4/10.0.0.7/tcp/30303".parse().unwrap();
		let events = routing_events(first, true, [&address].into_iter(), None, &mut known_peers);
		assert_eq!(events, vec![added("10.0.0.7")]);
		assert_eq!(known_peers.len(), 1);

		let second: Multiaddr = "/ip4/10.0.0.8/tcp/30303".parse().unwrap();
		let events = routing_events(
			random_peer(),
			true,
			[&second].into_iter(),
			Some(first),
			&mut known_peers,
		);
		assert_eq!(events, vec![removed("10.0.0.7"), added("10.0.0.8")]);
		assert_eq!(known_peers.len(), 1);
	}

	#[test]
	fn test_resolve_dial() {
		let mut pending_dials = PendingDials::new();
		let (sender, mut receiver) = oneshot::channel();
		let connection_id = ConnectionId::new_unchecked(1);
		pending_dials.insert(connection_id, sender);
		let peer_id = random_peer();

		assert!(!resolve_dial(
			&mut pending_dials,
			ConnectionId::new_unchecked(2),
			Ok(peer_id)
		));
		assert_eq!(pending_dials.len(), 1);

		assert!(resolve_dial(&mut pending_dials, connection_id, Ok(peer_id)));
		assert!(pending_dials.is_empty());
		assert_eq!(receiver.try_recv().unwrap().unwrap(), peer_id);
	}

	#[test]
	fn test_connection_failed() {
		let mut pending_dials = PendingDials::new();
		let (sender, mut receiver) = oneshot::channel();
		let connection_id = ConnectionId::new_unchecked(7);
		pending_dials.insert(connection_id, sender);

		let event = connection_failed(&mut pending_dials, connection_id, None, "connection refused");
		let expected = "Outgoing connection failed: connection refused".to_string();
		assert_eq!(event, TransportEvent::TransportError(expected.clone()));
		assert!(pending_dials.is_empty());
		assert!(matches!(
			receiver.try_recv().unwrap(),
			Err(Error::Command(message)) if message == expected
		));
	}

	#[test]
	fn test_connection_failed_without_pending_dial() {
		let mut pending_dials = PendingDials::new();
		let peer_id = random_peer();

		let event = connection_failed(
			&mut pending_dials,
			ConnectionId::new_unchecked(3),
			Some(peer_id),
			"timeout",
		);
		assert_eq!(
			event,
			TransportEvent::TransportError(format!(
				"Outgoing connection to {peer_id} failed: timeout"
			))
		);
	}
}
