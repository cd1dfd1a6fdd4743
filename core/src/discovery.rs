//! Iterative discovery: bootstrap from seeds, expand the frontier from every
//! newly found peer, refresh on a fixed cadence and stop once a round yields
//! nothing new.
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{
	sync::{mpsc::UnboundedReceiver, Semaphore},
	task::JoinSet,
	time::{interval_at, sleep_until, Instant, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn, Instrument};

use crate::{
	network::{
		resolver::{NodeResolver, Resolver},
		DiscoveryTransport, TransportEvent,
	},
	recorder::{RecordContext, Recorder},
	registry::Registry,
	shutdown::Controller,
	types::{
		duration_seconds_format, DiscoverySnapshot, DiscoveryState, PeerAddress, PeerIdentity,
		Termination,
	},
};

/// Discovery configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
	/// Seed node references, `enode://` URLs or multiaddresses (default: empty).
	pub seeds: Vec<String>,
	/// Delay between refresh rounds in seconds (default: 30).
	#[serde(with = "duration_seconds_format")]
	pub refresh_interval: Duration,
	/// Upper bound on refresh rounds (default: 20).
	pub max_rounds: u32,
	/// Rounds to run before a round without new peers ends the run (default: 3).
	pub min_rounds: u32,
	/// Stop once this many peers are found, 0 means unlimited (default: 0).
	pub max_nodes: usize,
	/// Hard limit on the run duration in seconds (default: 1800).
	#[serde(with = "duration_seconds_format")]
	pub timeout: Duration,
	/// Maximum number of bootstraps against discovered peers running at once (default: 16).
	pub bootstrap_parallelization_limit: usize,
	/// Hostname resolution timeout in seconds (default: 5).
	#[serde(with = "duration_seconds_format")]
	pub resolve_timeout: Duration,
}

impl Default for DiscoveryConfig {
	fn default() -> Self {
		Self {
			seeds: vec![],
			refresh_interval: Duration::from_secs(30),
			max_rounds: 20,
			min_rounds: 3,
			max_nodes: 0,
			timeout: Duration::from_secs(30 * 60),
			bootstrap_parallelization_limit: 16,
			resolve_timeout: Duration::from_secs(5),
		}
	}
}

pub const SEED_LIST_EMPTY_MESSAGE: &str = r#"
Seed node list must not be empty.
Either use a '--seed' flag or add a list of seeds in the configuration file.
"#;

impl DiscoveryConfig {
	pub fn validate(&self) -> Result<()> {
		if self.seeds.is_empty() {
			return Err(eyre!(SEED_LIST_EMPTY_MESSAGE));
		}
		if self.min_rounds > self.max_rounds {
			return Err(eyre!(
				"min_rounds ({}) must not exceed max_rounds ({})",
				self.min_rounds,
				self.max_rounds
			));
		}
		if self.refresh_interval.is_zero() {
			return Err(eyre!("refresh_interval must be greater than zero"));
		}
		if self.bootstrap_parallelization_limit == 0 {
			return Err(eyre!(
				"bootstrap_parallelization_limit must be greater than zero"
			));
		}
		Ok(())
	}
}

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
	pub state: DiscoveryState,
	pub termination: Termination,
	pub rounds: u32,
	pub peers: Vec<PeerAddress>,
}

/// Decides whether the run ends at this refresh tick.
///
/// Checked in order: round limit, node limit, then no growth since the
/// previous tick once `min_rounds` have passed.
pub fn evaluate(
	cfg: &DiscoveryConfig,
	snapshot: DiscoverySnapshot,
	previous: Option<DiscoverySnapshot>,
) -> Option<Termination> {
	if snapshot.round >= cfg.max_rounds {
		return Some(Termination::MaxRounds);
	}
	if cfg.max_nodes > 0 && snapshot.count >= cfg.max_nodes {
		return Some(Termination::MaxNodes);
	}
	match previous {
		Some(previous) if previous.count == snapshot.count && snapshot.round >= cfg.min_rounds => {
			Some(Termination::Stagnation)
		},
		_ => None,
	}
}

pub struct Discovery<T> {
	cfg: DiscoveryConfig,
	transport: Arc<T>,
	events: UnboundedReceiver<TransportEvent>,
	registry: Registry,
	recorder: Recorder,
	resolver: Arc<dyn NodeResolver + Send + Sync>,
	shutdown: Controller<String>,
	permits: Arc<Semaphore>,
	// Addresses a bootstrap was already started for
	bootstrapped: HashSet<PeerIdentity>,
	round: u32,
}

impl<T> Discovery<T>
where
	T: DiscoveryTransport + Send + Sync + 'static,
{
	pub fn new(
		cfg: DiscoveryConfig,
		transport: Arc<T>,
		events: UnboundedReceiver<TransportEvent>,
		recorder: Recorder,
		shutdown: Controller<String>,
	) -> Self {
		let permits = Arc::new(Semaphore::new(cfg.bootstrap_parallelization_limit.max(1)));
		Self {
			resolver: Arc::new(Resolver::new(cfg.resolve_timeout)),
			cfg,
			transport,
			events,
			registry: Registry::new(),
			recorder,
			shutdown,
			permits,
			bootstrapped: HashSet::new(),
			round: 0,
		}
	}

	/// Replaces the DNS backed seed resolver.
	pub fn with_resolver(mut self, resolver: impl NodeResolver + Send + Sync + 'static) -> Self {
		self.resolver = Arc::new(resolver);
		self
	}

	/// Shared handle to the peers found so far.
	pub fn registry(&self) -> Registry {
		self.registry.clone()
	}

	/// Runs discovery until a termination condition fires, then shuts the
	/// transport down and writes the summary.
	pub async fn run(mut self) -> Result<DiscoveryOutcome> {
		let deadline = Instant::now() + self.cfg.timeout;
		info!(
			seeds = self.cfg.seeds.len(),
			max_rounds = self.cfg.max_rounds,
			min_rounds = self.cfg.min_rounds,
			max_nodes = self.cfg.max_nodes,
			"Starting discovery"
		);

		let seeds = tokio::select! {
			biased;
			reason = self.shutdown.triggered_shutdown() => Err(Termination::Shutdown(reason)),
			_ = sleep_until(deadline) => Err(Termination::Timeout),
			seeds = self.resolve_seeds() => Ok(seeds),
		};

		let termination = match seeds {
			Ok(seeds) => self.crawl(seeds, deadline).await,
			Err(termination) => {
				debug!("Seed resolution interrupted: {termination}");
				termination
			},
		};

		self.finish(termination).await
	}

	async fn resolve_seeds(&self) -> Vec<PeerAddress> {
		let resolutions = join_all(
			self.cfg
				.seeds
				.iter()
				.map(|seed| async move { (seed, self.resolver.resolve(seed).await) }),
		)
		.await;

		let mut seeds: Vec<PeerAddress> = vec![];
		for (seed, result) in resolutions {
			match result {
				Ok(address) if seeds.contains(&address) => {
					debug!("Seed {seed} resolves to an already listed address {address}");
				},
				Ok(address) => seeds.push(address),
				Err(error) => warn!("Skipping seed: {error}"),
			}
		}
		seeds
	}

	async fn crawl(&mut self, seeds: Vec<PeerAddress>, deadline: Instant) -> Termination {
		let mut frontier = JoinSet::new();
		for seed in seeds {
			self.spawn_bootstrap(&mut frontier, seed);
		}

		let period = self.cfg.refresh_interval;
		let mut ticker = interval_at(Instant::now() + period, period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let timeout = sleep_until(deadline);
		tokio::pin!(timeout);
		let mut previous: Option<DiscoverySnapshot> = None;

		let termination = loop {
			tokio::select! {
				biased;
				reason = self.shutdown.triggered_shutdown() => break Termination::Shutdown(reason),
				_ = &mut timeout => break Termination::Timeout,
				_ = ticker.tick() => {
					let snapshot = self.registry.snapshot(self.round);
					if let Some(termination) = evaluate(&self.cfg, snapshot, previous) {
						break termination;
					}
					previous = Some(snapshot);
					self.round += 1;
					info!(round = self.round, peers = snapshot.count, "Starting refresh round");
					if let Err(error) = self.transport.refresh().await {
						warn!(round = self.round, "Refresh failed: {error}");
					}
				},
				event = self.events.recv() => match event {
					Some(event) => {
						if let Some(termination) = self.handle_event(&mut frontier, event).await {
							break termination;
						}
					},
					None => break Termination::TransportClosed,
				},
				Some(result) = frontier.join_next(), if !frontier.is_empty() => {
					if let Err(error) = result {
						if error.is_panic() {
							warn!("Bootstrap task panicked: {error}");
						}
					}
				},
			}
		};

		if !frontier.is_empty() {
			debug!("Aborting {} in-flight bootstraps", frontier.len());
		}
		frontier.shutdown().await;
		termination
	}

	async fn handle_event(
		&mut self,
		frontier: &mut JoinSet<()>,
		event: TransportEvent,
	) -> Option<Termination> {
		match event {
			TransportEvent::PeerAdded(peer) => {
				let max_nodes = self.cfg.max_nodes;
				if max_nodes > 0 && self.registry.len() >= max_nodes {
					trace!("Node limit reached, ignoring {peer}");
					return None;
				}
				if !self.registry.insert(peer.clone()) {
					trace!("Peer {} already known", peer.identity());
					return None;
				}

				let registry_size = self.registry.len();
				info!(
					peer = %peer.identity(),
					registry_size,
					round = self.round,
					"Discovered peer"
				);
				let context = RecordContext {
					registry_size,
					round: self.round,
				};
				if let Err(error) = self.recorder.record_peer(&peer, context).await {
					warn!("Failed to record peer: {error:#}");
				}

				if max_nodes > 0 && registry_size >= max_nodes {
					return Some(Termination::MaxNodes);
				}
				self.spawn_bootstrap(frontier, peer);
			},
			TransportEvent::PeerRemoved(peer) => {
				debug!(peer = %peer.identity(), "Peer removed from the discovery table");
			},
			TransportEvent::TransportError(error) => {
				debug!("Transport error: {error}");
			},
		}
		None
	}

	fn spawn_bootstrap(&mut self, frontier: &mut JoinSet<()>, address: PeerAddress) {
		if !self.bootstrapped.insert(address.identity()) {
			return;
		}
		let transport = self.transport.clone();
		let permits = self.permits.clone();
		frontier.spawn(
			async move {
				let Ok(_permit) = permits.acquire_owned().await else {
					return;
				};
				match transport.bootstrap(address.clone()).await {
					Ok(()) => trace!("Bootstrapped from {address}"),
					Err(error) => debug!("{error}"),
				}
			}
			.in_current_span(),
		);
	}

	async fn finish(self, termination: Termination) -> Result<DiscoveryOutcome> {
		let state = termination.state();
		let peers = self.registry.peers();
		info!(
			%state,
			rounds = self.round,
			peers = peers.len(),
			"Discovery finished: {termination}"
		);

		if let Err(error) = self.transport.shutdown().await {
			warn!("Transport shutdown failed: {error}");
		}

		let path = self
			.recorder
			.write_summary(&peers, self.round, &termination)
			.await
			.wrap_err("Failed to write discovery summary")?;
		info!("Summary written to {}", path.display());

		Ok(DiscoveryOutcome {
			state,
			termination,
			rounds: self.round,
			peers,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		network::{resolver::Error as ResolverError, Error, MockDiscoveryTransport},
		recorder::{read_log, read_summary},
	};
	use async_trait::async_trait;
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Mutex,
	};
	use tempfile::{tempdir, TempDir};
	use test_case::test_case;
	use tokio::{
		sync::mpsc::{unbounded_channel, UnboundedSender},
		time::sleep,
	};

	// Stands in for a DNS lookup that never answers
	struct StalledResolver;

	#[async_trait]
	impl NodeResolver for StalledResolver {
		async fn resolve(&self, _reference: &str) -> Result<PeerAddress, ResolverError> {
			std::future::pending().await
		}
	}

	#[derive(Default)]
	struct TestTransport {
		bootstraps: Mutex<Vec<PeerAddress>>,
		refreshes: AtomicUsize,
		shutdowns: AtomicUsize,
	}

	impl TestTransport {
		fn bootstraps(&self) -> Vec<PeerAddress> {
			self.bootstraps.lock().unwrap().clone()
		}

		fn bootstrapped(&self) -> HashSet<PeerAddress> {
			self.bootstraps().into_iter().collect()
		}
	}

	#[async_trait]
	impl DiscoveryTransport for TestTransport {
		async fn bootstrap(&self, address: PeerAddress) -> Result<(), Error> {
			self.bootstraps.lock().unwrap().push(address);
			Ok(())
		}

		async fn refresh(&self) -> Result<(), Error> {
			self.refreshes.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}

		async fn shutdown(&self) -> Result<(), Error> {
			self.shutdowns.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	fn peer(index: u8) -> PeerAddress {
		PeerAddress::new(format!("10.0.0.{index}"), 30303, 30303)
	}

	fn config(seeds: &[&str]) -> DiscoveryConfig {
		DiscoveryConfig {
			seeds: seeds.iter().map(ToString::to_string).collect(),
			..Default::default()
		}
	}

	fn discovery<T: DiscoveryTransport + Send + Sync + 'static>(
		cfg: DiscoveryConfig,
		transport: Arc<T>,
		shutdown: Controller<String>,
	) -> (Discovery<T>, UnboundedSender<TransportEvent>, TempDir) {
		let dir = tempdir().unwrap();
		let recorder = Recorder::create(dir.path(), &cfg.seeds).unwrap();
		let (sender, receiver) = unbounded_channel();
		let discovery = Discovery::new(cfg, transport, receiver, recorder, shutdown);
		(discovery, sender, dir)
	}

	fn snapshot(count: usize, round: u32) -> DiscoverySnapshot {
		DiscoverySnapshot { count, round }
	}

	#[test_case(snapshot(5, 20), None => Some(Termination::MaxRounds) ; "round limit")]
	#[test_case(snapshot(5, 20), Some(snapshot(1, 19)) => Some(Termination::MaxRounds) ; "round limit wins over growth")]
	#[test_case(snapshot(2, 0), None => None ; "first tick")]
	#[test_case(snapshot(2, 2), Some(snapshot(2, 1)) => None ; "no growth before min rounds")]
	#[test_case(snapshot(2, 3), Some(snapshot(2, 2)) => Some(Termination::Stagnation) ; "no growth after min rounds")]
	#[test_case(snapshot(3, 3), Some(snapshot(2, 2)) => None ; "growth after min rounds")]
	#[test_case(snapshot(3, 7), None => None ; "no previous snapshot")]
	fn test_evaluate(
		snapshot: DiscoverySnapshot,
		previous: Option<DiscoverySnapshot>,
	) -> Option<Termination> {
		evaluate(&DiscoveryConfig::default(), snapshot, previous)
	}

	#[test]
	fn test_evaluate_node_limit() {
		let cfg = DiscoveryConfig {
			max_nodes: 4,
			..Default::default()
		};
		assert_eq!(evaluate(&cfg, snapshot(4, 1), None), Some(Termination::MaxNodes));
		assert_eq!(evaluate(&cfg, snapshot(3, 1), None), None);
		assert_eq!(
			evaluate(&cfg, snapshot(4, 20), None),
			Some(Termination::MaxRounds)
		);
	}

	#[test_case(config(&[]) => false ; "no seeds")]
	#[test_case(config(&["/ip4/10.0.0.1/tcp/30303"]) => true ; "defaults")]
	#[test_case(DiscoveryConfig { min_rounds: 21, ..config(&["/ip4/10.0.0.1/tcp/30303"]) } => false ; "min rounds above max rounds")]
	#[test_case(DiscoveryConfig { refresh_interval: Duration::ZERO, ..config(&["/ip4/10.0.0.1/tcp/30303"]) } => false ; "zero refresh interval")]
	#[test_case(DiscoveryConfig { bootstrap_parallelization_limit: 0, ..config(&["/ip4/10.0.0.1/tcp/30303"]) } => false ; "zero parallelization limit")]
	fn test_validate(cfg: DiscoveryConfig) -> bool {
		cfg.validate().is_ok()
	}

	#[tokio::test(start_paused = true)]
	async fn test_stagnation_after_min_rounds() {
		let cfg = config(&["/ip4/10.0.0.1/tcp/30303", "/ip4/10.0.0.2/tcp/30303"]);
		let transport = Arc::new(TestTransport::default());
		let (discovery, sender, dir) = discovery(cfg, transport.clone(), Controller::new());
		sender.send(TransportEvent::PeerAdded(peer(1))).unwrap();
		sender.send(TransportEvent::PeerAdded(peer(2))).unwrap();

		let started = Instant::now();
		let outcome = discovery.run().await.unwrap();

		assert_eq!(outcome.state, DiscoveryState::Complete);
		assert_eq!(outcome.termination, Termination::Stagnation);
		assert_eq!(outcome.rounds, 3);
		assert_eq!(outcome.peers, vec![peer(1), peer(2)]);
		// Fourth tick ends the run
		assert!(started.elapsed() >= Duration::from_secs(4 * 30));
		assert!(started.elapsed() < Duration::from_secs(5 * 30));
		assert_eq!(transport.refreshes.load(Ordering::SeqCst), 3);
		assert_eq!(transport.shutdowns.load(Ordering::SeqCst), 1);
		// Seeds are bootstrapped once, also after being reported back
		assert_eq!(transport.bootstrapped(), HashSet::from([peer(1), peer(2)]));
		assert_eq!(transport.bootstraps().len(), 2);

		let summary = read_summary(dir.path().join("summary.json")).unwrap();
		assert!(summary.complete);
		assert_eq!(summary.rounds_completed, 3);
		assert_eq!(summary.peers, outcome.peers);
		assert_eq!(read_log(dir.path().join("peers.ndjson")).unwrap(), summary.peers);
	}

	#[tokio::test(start_paused = true)]
	async fn test_node_limit_reached_during_burst() {
		let cfg = DiscoveryConfig {
			max_nodes: 5,
			..config(&["/ip4/10.0.0.1/tcp/30303"])
		};
		let transport = Arc::new(TestTransport::default());
		let (discovery, sender, dir) = discovery(cfg, transport.clone(), Controller::new());
		for index in 1..=7 {
			sender.send(TransportEvent::PeerAdded(peer(index))).unwrap();
		}

		let outcome = discovery.run().await.unwrap();

		assert_eq!(outcome.state, DiscoveryState::Complete);
		assert_eq!(outcome.termination, Termination::MaxNodes);
		assert_eq!(outcome.rounds, 0);
		assert_eq!(outcome.peers, (1..=5).map(peer).collect::<Vec<_>>());
		assert_eq!(transport.refreshes.load(Ordering::SeqCst), 0);
		assert_eq!(read_log(dir.path().join("peers.ndjson")).unwrap().len(), 5);
		assert_eq!(read_summary(dir.path().join("summary.json")).unwrap().total_peers, 5);
	}

	#[tokio::test(start_paused = true)]
	async fn test_external_stop_writes_incomplete_summary() {
		let cfg = config(&["/ip4/10.0.0.1/tcp/30303"]);
		let shutdown = Controller::new();
		let transport = Arc::new(TestTransport::default());
		let (discovery, sender, dir) = discovery(cfg, transport.clone(), shutdown.clone());
		for index in 1..=3 {
			sender.send(TransportEvent::PeerAdded(peer(index))).unwrap();
		}
		tokio::spawn(async move {
			sleep(Duration::from_secs(31)).await;
			_ = shutdown.trigger_shutdown("Ctrl-C".to_string());
		});

		let outcome = discovery.run().await.unwrap();

		assert_eq!(outcome.state, DiscoveryState::Stopped);
		assert_eq!(outcome.termination, Termination::Shutdown("Ctrl-C".to_string()));
		assert_eq!(outcome.rounds, 1);
		assert_eq!(transport.shutdowns.load(Ordering::SeqCst), 1);

		let summary = read_summary(dir.path().join("summary.json")).unwrap();
		assert!(!summary.complete);
		assert_eq!(summary.total_peers, 3);
		assert_eq!(summary.peers, (1..=3).map(peer).collect::<Vec<_>>());
	}

	#[tokio::test(start_paused = true)]
	async fn test_stop_before_start() {
		let shutdown = Controller::new();
		shutdown.trigger_shutdown("stopped".to_string()).unwrap();
		let transport = Arc::new(TestTransport::default());
		let (discovery, _sender, dir) = discovery(
			config(&["/ip4/10.0.0.1/tcp/30303"]),
			transport.clone(),
			shutdown,
		);

		let outcome = discovery.run().await.unwrap();

		assert_eq!(outcome.termination, Termination::Shutdown("stopped".to_string()));
		assert_eq!(outcome.rounds, 0);
		assert!(transport.bootstraps().is_empty());
		assert!(dir.path().join("summary.json").exists());
	}

	#[tokio::test(start_paused = true)]
	async fn test_timeout() {
		let cfg = DiscoveryConfig {
			max_rounds: 100,
			min_rounds: 50,
			timeout: Duration::from_secs(100),
			..config(&["/ip4/10.0.0.1/tcp/30303"])
		};
		let transport = Arc::new(TestTransport::default());
		let (discovery, _sender, dir) = discovery(cfg, transport, Controller::new());

		let started = Instant::now();
		let outcome = discovery.run().await.unwrap();

		assert_eq!(outcome.state, DiscoveryState::Stopped);
		assert_eq!(outcome.termination, Termination::Timeout);
		assert_eq!(outcome.rounds, 3);
		assert!(started.elapsed() >= Duration::from_secs(100));
		assert!(started.elapsed() < Duration::from_secs(120));
		assert!(!read_summary(dir.path().join("summary.json")).unwrap().complete);
	}

	#[tokio::test(start_paused = true)]
	async fn test_timeout_during_seed_resolution() {
		let cfg = DiscoveryConfig {
			timeout: Duration::from_secs(1),
			resolve_timeout: Duration::from_secs(5),
			..config(&["/dns/boot.example.org/tcp/30303"])
		};
		let transport = Arc::new(TestTransport::default());
		let (discovery, _sender, dir) = discovery(cfg, transport.clone(), Controller::new());
		let discovery = discovery.with_resolver(StalledResolver);

		let started = Instant::now();
		let outcome = discovery.run().await.unwrap();

		assert_eq!(outcome.state, DiscoveryState::Stopped);
		assert_eq!(outcome.termination, Termination::Timeout);
		assert_eq!(outcome.rounds, 0);
		assert!(started.elapsed() >= Duration::from_secs(1));
		assert!(started.elapsed() < Duration::from_secs(5));
		assert!(transport.bootstraps().is_empty());
		assert_eq!(transport.shutdowns.load(Ordering::SeqCst), 1);
		assert!(!read_summary(dir.path().join("summary.json")).unwrap().complete);
	}

	#[tokio::test(start_paused = true)]
	async fn test_stop_during_seed_resolution() {
		let shutdown = Controller::new();
		let transport = Arc::new(TestTransport::default());
		let (discovery, _sender, _dir) = discovery(
			config(&["/dns/boot.example.org/tcp/30303"]),
			transport.clone(),
			shutdown.clone(),
		);
		let discovery = discovery.with_resolver(StalledResolver);
		tokio::spawn(async move {
			sleep(Duration::from_secs(2)).await;
			_ = shutdown.trigger_shutdown("Ctrl-C".to_string());
		});

		let outcome = discovery.run().await.unwrap();

		assert_eq!(outcome.termination, Termination::Shutdown("Ctrl-C".to_string()));
		assert!(transport.bootstraps().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_round_limit() {
		let cfg = DiscoveryConfig {
			max_rounds: 2,
			min_rounds: 2,
			..config(&["/ip4/10.0.0.1/tcp/30303"])
		};
		let transport = Arc::new(TestTransport::default());
		let (discovery, sender, _dir) = discovery(cfg, transport.clone(), Controller::new());
		sender.send(TransportEvent::PeerAdded(peer(1))).unwrap();

		let outcome = discovery.run().await.unwrap();

		assert_eq!(outcome.termination, Termination::MaxRounds);
		assert_eq!(outcome.rounds, 2);
		assert_eq!(transport.refreshes.load(Ordering::SeqCst), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn test_transport_closed() {
		let transport = Arc::new(TestTransport::default());
		let (discovery, sender, _dir) = discovery(
			config(&["/ip4/10.0.0.1/tcp/30303"]),
			transport,
			Controller::new(),
		);
		sender.send(TransportEvent::PeerAdded(peer(1))).unwrap();
		drop(sender);

		let outcome = discovery.run().await.unwrap();

		assert_eq!(outcome.state, DiscoveryState::Stopped);
		assert_eq!(outcome.termination, Termination::TransportClosed);
		assert_eq!(outcome.peers, vec![peer(1)]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_duplicates_and_removals_keep_registry() {
		let transport = Arc::new(TestTransport::default());
		let (discovery, sender, dir) = discovery(
			config(&["/ip4/10.0.0.1/tcp/30303"]),
			transport.clone(),
			Controller::new(),
		);
		let registry = discovery.registry();
		let events = [
			TransportEvent::PeerAdded(peer(2)),
			TransportEvent::PeerAdded(PeerAddress::new("10.0.0.2", 30303, 40404)),
			TransportEvent::PeerRemoved(peer(2)),
			TransportEvent::TransportError("dial failure".to_string()),
			TransportEvent::PeerAdded(peer(3)),
			TransportEvent::PeerAdded(peer(2)),
		];
		for event in events {
			sender.send(event).unwrap();
		}

		let outcome = discovery.run().await.unwrap();

		assert_eq!(outcome.termination, Termination::Stagnation);
		assert_eq!(outcome.peers, vec![peer(2), peer(3)]);
		assert_eq!(registry.len(), 2);
		assert_eq!(read_log(dir.path().join("peers.ndjson")).unwrap().len(), 2);
		// Seed plus one bootstrap per discovered peer
		assert_eq!(
			transport.bootstrapped(),
			HashSet::from([peer(1), peer(2), peer(3)])
		);
		assert_eq!(transport.bootstraps().len(), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn test_malformed_seeds_are_skipped() {
		let transport = Arc::new(TestTransport::default());
		let (discovery, _sender, _dir) = discovery(
			config(&["not a node", "/ip4/10.0.0.1/tcp/30303", "/ip4/10.0.0.1/tcp/30303"]),
			transport.clone(),
			Controller::new(),
		);

		let outcome = discovery.run().await.unwrap();

		assert_eq!(outcome.termination, Termination::Stagnation);
		assert!(outcome.peers.is_empty());
		assert_eq!(transport.bootstraps(), vec![peer(1)]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_failures_do_not_change_state() {
		let mut transport = MockDiscoveryTransport::new();
		transport.expect_bootstrap().times(2).returning(|address| {
			Box::pin(async move { Err(Error::bootstrap(&address, "connection refused")) })
		});
		transport
			.expect_refresh()
			.times(3)
			.returning(|| Box::pin(async move { Err(Error::Refresh("no known peers".into())) }));
		transport
			.expect_shutdown()
			.times(1)
			.returning(|| Box::pin(async move { Ok(()) }));

		let (discovery, sender, _dir) = discovery(
			config(&["/ip4/10.0.0.1/tcp/30303"]),
			Arc::new(transport),
			Controller::new(),
		);
		sender
			.send(TransportEvent::TransportError("timeout".to_string()))
			.unwrap();
		sender.send(TransportEvent::PeerAdded(peer(3))).unwrap();

		let outcome = discovery.run().await.unwrap();

		assert_eq!(outcome.state, DiscoveryState::Complete);
		assert_eq!(outcome.termination, Termination::Stagnation);
		assert_eq!(outcome.rounds, 3);
		assert_eq!(outcome.peers, vec![peer(3)]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_summary_failure_is_an_error() {
		let transport = Arc::new(TestTransport::default());
		let (discovery, sender, dir) = discovery(
			config(&["/ip4/10.0.0.1/tcp/30303"]),
			transport,
			Controller::new(),
		);
		drop(sender);
		// A directory in place of the summary makes the final rename fail
		std::fs::create_dir(dir.path().join("summary.json")).unwrap();
		std::fs::write(dir.path().join("summary.json").join("keep"), "").unwrap();

		assert!(discovery.run().await.is_err());
	}
}
