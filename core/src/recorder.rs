//! Durable output of a discovery run.
//!
//! Every newly found peer is appended to `peers.ndjson` as soon as it enters
//! the registry. When the run ends, `summary.json` is written once, atomically.
//! A missing summary therefore marks a run that did not finish.
use chrono::{DateTime, Utc};
use color_eyre::{eyre::WrapErr, Result};
use serde::{Deserialize, Serialize};
use std::{
	fs::{self, OpenOptions},
	io,
	path::{Path, PathBuf},
};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{DiscoveryState, PeerAddress, PeerIdentity, Termination};

pub const PEER_LOG_FILE: &str = "peers.ndjson";
pub const SUMMARY_FILE: &str = "summary.json";

/// Registry state at the moment a peer was recorded.
#[derive(Debug, Clone, Copy)]
pub struct RecordContext {
	pub registry_size: usize,
	pub round: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerRecord {
	#[serde(flatten)]
	pub peer: PeerAddress,
	pub identity: PeerIdentity,
	pub registry_size: usize,
	pub round: u32,
	pub discovered_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Summary {
	pub run_id: Uuid,
	pub started_at: DateTime<Utc>,
	pub finished_at: DateTime<Utc>,
	pub seeds: Vec<String>,
	pub total_peers: usize,
	pub peers: Vec<PeerAddress>,
	pub rounds_completed: u32,
	pub complete: bool,
	pub termination: Termination,
}

pub struct Recorder {
	dir: PathBuf,
	run_id: Uuid,
	started_at: DateTime<Utc>,
	seeds: Vec<String>,
	log: File,
}

impl Recorder {
	/// Prepares the output directory for a new run.
	///
	/// Truncates the peer log and removes the summary left by a previous run.
	pub fn create(dir: impl AsRef<Path>, seeds: &[String]) -> Result<Self> {
		let dir = dir.as_ref().to_path_buf();
		fs::create_dir_all(&dir)
			.wrap_err_with(|| format!("Failed to create output directory {}", dir.display()))?;

		let summary_path = dir.join(SUMMARY_FILE);
		match fs::remove_file(&summary_path) {
			Ok(()) => debug!("Removed stale summary {}", summary_path.display()),
			Err(error) if error.kind() == io::ErrorKind::NotFound => {},
			Err(error) => {
				return Err(error).wrap_err_with(|| {
					format!("Failed to remove stale summary {}", summary_path.display())
				})
			},
		}

		let log_path = dir.join(PEER_LOG_FILE);
		fs::File::create(&log_path)
			.wrap_err_with(|| format!("Failed to create peer log {}", log_path.display()))?;
		let log = OpenOptions::new()
			.append(true)
			.open(&log_path)
			.map(File::from_std)
			.wrap_err_with(|| format!("Failed to open peer log {}", log_path.display()))?;

		Ok(Self {
			dir,
			run_id: Uuid::new_v4(),
			started_at: Utc::now(),
			seeds: seeds.to_vec(),
			log,
		})
	}

	pub fn run_id(&self) -> Uuid {
		self.run_id
	}

	pub fn log_path(&self) -> PathBuf {
		self.dir.join(PEER_LOG_FILE)
	}

	pub fn summary_path(&self) -> PathBuf {
		self.dir.join(SUMMARY_FILE)
	}

	/// Appends one line to the peer log and flushes it.
	pub async fn record_peer(&mut self, peer: &PeerAddress, context: RecordContext) -> Result<()> {
		let record = PeerRecord {
			peer: peer.clone(),
			identity: peer.identity(),
			registry_size: context.registry_size,
			round: context.round,
			discovered_at: Utc::now(),
		};
		let mut line = serde_json::to_vec(&record)?;
		line.push(b'\n');
		self.log.write_all(&line).await.wrap_err_with(|| {
			format!("Failed to append {} to the peer log", record.identity)
		})?;
		self.log
			.flush()
			.await
			.wrap_err_with(|| format!("Failed to flush the peer log after {}", record.identity))
	}

	/// Writes the final summary through a temporary file, so readers never see a partial one.
	pub async fn write_summary(
		&self,
		peers: &[PeerAddress],
		rounds_completed: u32,
		termination: &Termination,
	) -> Result<PathBuf> {
		let summary = Summary {
			run_id: self.run_id,
			started_at: self.started_at,
			finished_at: Utc::now(),
			seeds: self.seeds.clone(),
			total_peers: peers.len(),
			peers: peers.to_vec(),
			rounds_completed,
			complete: termination.state() == DiscoveryState::Complete,
			termination: termination.clone(),
		};

		let path = self.summary_path();
		let tmp_path = self.dir.join(format!("{SUMMARY_FILE}.tmp"));
		let content = serde_json::to_vec_pretty(&summary)?;
		tokio::fs::write(&tmp_path, content)
			.await
			.wrap_err_with(|| format!("Failed to write {}", tmp_path.display()))?;
		tokio::fs::rename(&tmp_path, &path)
			.await
			.wrap_err_with(|| format!("Failed to move summary into {}", path.display()))?;
		Ok(path)
	}
}

/// Replays the peer log in discovery order.
///
/// A malformed last line without a newline is the trace of an interrupted
/// write and is skipped. Malformed lines anywhere else are an error.
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<PeerAddress>> {
	let path = path.as_ref();
	let content = fs::read_to_string(path)
		.wrap_err_with(|| format!("Failed to read peer log {}", path.display()))?;
	let terminated = content.ends_with('\n');
	let lines: Vec<&str> = content.lines().collect();

	let mut peers = Vec::with_capacity(lines.len());
	for (index, line) in lines.iter().enumerate() {
		if line.trim().is_empty() {
			continue;
		}
		match serde_json::from_str::<PeerRecord>(line) {
			Ok(record) => peers.push(record.peer),
			Err(error) if !terminated && index + 1 == lines.len() => {
				warn!("Ignoring truncated last peer log entry: {error}");
			},
			Err(error) => {
				return Err(error).wrap_err_with(|| {
					format!("Invalid entry on line {} of {}", index + 1, path.display())
				})
			},
		}
	}
	Ok(peers)
}

pub fn read_summary(path: impl AsRef<Path>) -> Result<Summary> {
	let path = path.as_ref();
	let content =
		fs::read(path).wrap_err_with(|| format!("Failed to read summary {}", path.display()))?;
	serde_json::from_slice(&content).wrap_err("Invalid summary")
}
