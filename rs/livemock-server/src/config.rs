use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use livemock::asset::BatchConfig;

/// Publishes a repeating, wall-clock-aligned multi-bitrate CMAF catalog over MoQ (§6).
#[derive(Parser, Clone, Debug)]
pub struct Config {
	/// Directory of fragmented CMAF seed files, one per variant.
	#[arg(long, env = "LIVEMOCK_ASSETS")]
	pub assets: PathBuf,

	/// The namespace this server announces and serves tracks under.
	#[arg(long, default_value = "live")]
	pub namespace: String,

	/// Samples batched per CMAF object for video tracks.
	#[arg(long, default_value_t = 1)]
	pub video_batch: u64,

	/// Samples batched per CMAF object for audio tracks.
	#[arg(long, default_value_t = 1)]
	pub audio_batch: u64,

	/// Languages to synthesize dynamic WVTT subtitle tracks for.
	#[arg(long, value_delimiter = ',')]
	pub wvtt_langs: Vec<String>,

	/// Languages to synthesize dynamic STPP subtitle tracks for.
	#[arg(long, value_delimiter = ',')]
	pub stpp_langs: Vec<String>,

	/// Number of groups a subscriber may fall behind before it is evicted (§4.5).
	#[arg(long, default_value_t = 10)]
	pub stale_threshold: u64,

	/// Optional HTTP port serving `/fingerprint` for WebTransport certificate-hash trust (§6).
	#[arg(long)]
	pub fingerprint_port: Option<u16>,

	/// The MoQ server configuration (listen address, TLS).
	#[command(flatten)]
	pub server: moq_native::ServerConfig,

	/// The log configuration.
	#[command(flatten)]
	pub log: moq_native::Log,
}

impl Config {
	pub fn batch(&self) -> BatchConfig {
		BatchConfig {
			video: self.video_batch,
			audio: self.audio_batch,
		}
	}

	pub fn fingerprint_addr(&self) -> Option<SocketAddr> {
		self.fingerprint_port.map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
	}
}
