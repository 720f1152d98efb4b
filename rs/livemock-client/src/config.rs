use std::path::PathBuf;

use clap::Parser;
use url::Url;

/// Subscribes to a livemock publisher's catalog and plays (or switches) its tracks (§4.7).
#[derive(Parser, Clone, Debug)]
pub struct Config {
	/// Connect to the given URL, starting with https:// (WebTransport) or moql:// (QUIC).
	#[arg(long)]
	pub url: Url,

	/// The namespace the publisher announced its broadcast under.
	#[arg(long, default_value = "live")]
	pub namespace: String,

	/// Substring match against catalog track names to select the video variant.
	/// The first video track is used if unset.
	#[arg(long)]
	pub video: Option<String>,

	/// Substring match against catalog track names to select the audio variant.
	/// The first audio track is used if unset.
	#[arg(long)]
	pub audio: Option<String>,

	/// Write the selected video track's output here. `-` writes to stdout.
	#[arg(long)]
	pub video_out: Option<PathBuf>,

	/// Write the selected audio track's output here. `-` writes to stdout.
	#[arg(long)]
	pub audio_out: Option<PathBuf>,

	/// Remux the selected video/audio tracks into one two-track fMP4 and write it here.
	#[arg(long)]
	pub mux_out: Option<PathBuf>,

	/// After this many groups, issue SUBSCRIBE_UPDATE(endGroup) and end the subscription
	/// once SUBSCRIBE_DONE arrives. Zero (the default) disables this.
	#[arg(long, default_value_t = 0)]
	pub end_after: u64,

	/// Periodically switch the video track to a different catalog entry matching this
	/// substring, alternating with the initial selection every `switch_interval_secs`.
	#[arg(long)]
	pub switch_tracks: Option<String>,

	/// How often (in seconds) to alternate between `--video` and `--switch-tracks`.
	#[arg(long, default_value_t = 10)]
	pub switch_interval_secs: u64,

	/// The MoQ client configuration.
	#[command(flatten)]
	pub client: moq_native::ClientConfig,

	/// The log configuration.
	#[command(flatten)]
	pub log: moq_native::Log,
}

impl Config {
	pub fn switching_enabled(&self) -> bool {
		self.switch_tracks.is_some()
	}
}
