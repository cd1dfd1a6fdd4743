use async_trait::async_trait;
use libp2p::{core::transport::ListenerId, swarm::dial_opts::DialOpts, Multiaddr, PeerId};
use std::{sync::Arc, time::Duration};
use tokio::{
	sync::{mpsc::UnboundedSender, oneshot, Mutex},
	time::timeout,
};
use tracing::{debug, trace};

use super::{peer_multiaddr, Command, EventLoop};
use crate::{
	network::{DiscoveryTransport, Error},
	types::PeerAddress,
};

#[derive(Clone)]
pub struct Client {
	command_sender: UnboundedSender<Command>,
	/// Upper bound for establishing a connection to a bootstrap address
	dial_timeout: Duration,
	listeners: Arc<Mutex<Vec<ListenerId>>>,
}

impl Client {
	pub fn new(sender: UnboundedSender<Command>, dial_timeout: Duration) -> Self {
		Self {
			command_sender: sender,
			dial_timeout,
			listeners: Arc::new(Mutex::new(vec![])),
		}
	}

	async fn execute_sync<F, T>(&self, command_creator: F) -> Result<T, Error>
	where
		F: FnOnce(oneshot::Sender<Result<T, Error>>) -> Command,
	{
		let (response_sender, response_receiver) = oneshot::channel();
		let command = command_creator(response_sender);
		self.command_sender
			.send(command)
			.map_err(|_| Error::CommandChannelClosed)?;
		response_receiver
			.await
			.map_err(|_| Error::ResponseDropped)?
	}

	/// Starts listening on provided multiaddresses and saves the listener IDs
	pub async fn start_listening(&self, addrs: Vec<Multiaddr>) -> Result<Vec<ListenerId>, Error> {
		self.listeners.lock().await.clear();
		let listeners = self
			.execute_sync(|response_sender| {
				Box::new(move |context: &mut EventLoop| {
					let results: Result<Vec<ListenerId>, _> = addrs
						.into_iter()
						.map(|addr| context.swarm.listen_on(addr))
						.collect();
					_ = response_sender.send(results.map_err(|error| Error::Command(error.to_string())));
					Ok(())
				})
			})
			.await?;

		self.listeners.lock().await.extend(&listeners);
		Ok(listeners)
	}

	/// Dials an address without an expected peer ID and resolves with the ID the remote presented
	async fn dial(&self, address: Multiaddr) -> Result<PeerId, Error> {
		self.execute_sync(|response_sender| {
			Box::new(move |context: &mut EventLoop| {
				let opts = DialOpts::unknown_peer_id().address(address).build();
				let connection_id = opts.connection_id();
				match context.swarm.dial(opts) {
					Ok(()) => {
						context
							.pending_dials
							.insert(connection_id, response_sender);
					},
					Err(error) => {
						_ = response_sender.send(Err(Error::Command(error.to_string())));
					},
				}
				Ok(())
			})
		})
		.await
	}

	async fn add_address(&self, peer_id: PeerId, peer_addr: Multiaddr) -> Result<(), Error> {
		self.command_sender
			.send(Box::new(move |context: &mut EventLoop| {
				context
					.swarm
					.behaviour_mut()
					.kademlia
					.add_address(&peer_id, peer_addr);
				Ok(())
			}))
			.map_err(|_| Error::CommandChannelClosed)
	}

	/// Starts a lookup for the peers closest to the given one, which makes it share its neighbours
	async fn get_closest_peers(&self, peer_id: PeerId) -> Result<(), Error> {
		self.command_sender
			.send(Box::new(move |context: &mut EventLoop| {
				let query_id = context
					.swarm
					.behaviour_mut()
					.kademlia
					.get_closest_peers(peer_id);
				trace!("Closest peers query {query_id:?} started for {peer_id}");
				Ok(())
			}))
			.map_err(|_| Error::CommandChannelClosed)
	}
}

#[async_trait]
impl DiscoveryTransport for Client {
	async fn bootstrap(&self, address: PeerAddress) -> Result<(), Error> {
		let multiaddr = peer_multiaddr(&address);
		let peer_id = timeout(self.dial_timeout, self.dial(multiaddr.clone()))
			.await
			.map_err(|_| Error::bootstrap(&address, "dial timed out"))?
			.map_err(|error| Error::bootstrap(&address, error))?;
		debug!("Connected to {address} as {peer_id}");

		self.add_address(peer_id, multiaddr).await?;
		self.get_closest_peers(peer_id).await
	}

	async fn refresh(&self) -> Result<(), Error> {
		self.execute_sync(|response_sender| {
			Box::new(move |context: &mut EventLoop| {
				let result = context
					.swarm
					.behaviour_mut()
					.kademlia
					.bootstrap()
					.map(|query_id| trace!("Refresh query {query_id:?} started"))
					.map_err(|error| Error::Refresh(error.to_string()));
				_ = response_sender.send(result);
				Ok(())
			})
		})
		.await
	}

	async fn shutdown(&self) -> Result<(), Error> {
		let listener_ids = std::mem::take(&mut *self.listeners.lock().await);
		let result = self
			.execute_sync(|response_sender| {
				Box::new(move |context: &mut EventLoop| {
					listener_ids.into_iter().for_each(|listener_id| {
						// `remove_listener` is infallible
						context.swarm.remove_listener(listener_id);
					});
					context.stop();
					_ = response_sender.send(Ok(()));
					Ok(())
				})
			})
			.await;

		match result {
			// Event loop already exited and released the swarm
			Err(Error::CommandChannelClosed) => {
				debug!("Network event loop already stopped");
				Ok(())
			},
			result => result,
		}
	}
}
