//! Subscriber-side switching engine (§4.7): fetches the catalog, selects one
//! video and/or one audio variant, demultiplexes objects into raw per-type
//! outputs and/or a CMAF remuxer, and optionally performs seamless periodic
//! track switching through `SUBSCRIBE_UPDATE`-equivalent control messages.

mod catalog;
mod config;
mod control;
mod remux;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use bytes::Bytes;
use clap::Parser;
use livemock::catalog::CatalogTrack;
use moq_lite::{BroadcastConsumer, Delivery, Origin};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use config::Config;
use control::ControlChannel;
use remux::Remuxer;

const VIDEO_TRACK_ID: u32 = remux::VIDEO_TRACK_ID;
const AUDIO_TRACK_ID: u32 = remux::AUDIO_TRACK_ID;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	// Some dependency pulls in `ring` regardless of the compiled QUIC backend;
	// install the default provider up front so rustls doesn't panic picking one.
	rustls::crypto::aws_lc_rs::default_provider()
		.install_default()
		.expect("failed to install default crypto provider");

	let config = Config::parse();
	config.log.init();

	if let Err(err) = run(config).await {
		tracing::error!(%err, "session ended with error");
		return Err(err);
	}
	Ok(())
}

/// Either a regular file or stdout (`-`), written to append-only.
enum Sink {
	File(tokio::fs::File),
	Stdout(tokio::io::Stdout),
}

impl Sink {
	async fn open(path: &PathBuf) -> anyhow::Result<Self> {
		if path.as_os_str() == "-" {
			return Ok(Sink::Stdout(tokio::io::stdout()));
		}
		let file = tokio::fs::File::create(path)
			.await
			.with_context(|| format!("failed to create {}", path.display()))?;
		Ok(Sink::File(file))
	}

	async fn write(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
		match self {
			Sink::File(f) => Self::write_to(f, bytes).await,
			Sink::Stdout(s) => Self::write_to(s, bytes).await,
		}
	}

	async fn write_to<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> anyhow::Result<()> {
		w.write_all(bytes).await?;
		Ok(())
	}
}

/// One demultiplexed object, tagged with the in-box track id it should carry
/// once remuxed and the MoQ group it belongs to (for the switch-handover
/// dedup policy in §4.7/§9).
struct Frame {
	track_id: u32,
	group: u64,
	payload: Bytes,
}

async fn run(config: Config) -> anyhow::Result<()> {
	let client = config.client.clone().init()?;

	// Our own broadcast, used only to carry SUBSCRIBE_UPDATE-equivalent
	// control messages back to the publisher (§4.7, livemock::control).
	let mut publish_origin = Origin::produce();
	let control = ControlChannel::new(&mut publish_origin.producer)?;
	let control = std::sync::Arc::new(AsyncMutex::new(control));

	// The origin that receives the publisher's `ANNOUNCE` for its namespace.
	let consume_origin = Origin::produce();

	tracing::info!(url = %config.url, "connecting");
	let session = client
		.with_publish(publish_origin.consumer)
		.with_consume(consume_origin.producer)
		.connect(config.url.clone())
		.await
		.context("failed to connect")?;

	let mut announced = consume_origin.consumer;
	let broadcast = loop {
		let (path, broadcast) = announced
			.announced()
			.await
			.context("session closed before the publisher's broadcast was announced")?;
		if path.as_str() != config.namespace.as_str() {
			continue;
		}
		if let Some(broadcast) = broadcast {
			tracing::info!(path = %path.as_str(), "broadcast announced");
			break broadcast;
		}
	};

	let catalog = catalog::fetch(&broadcast).await?;
	tracing::info!(tracks = catalog.tracks.len(), "catalog fetched");

	// Supplementary: learn each track's current live edge before subscribing,
	// standing in for the `LargestLocation` a real `SUBSCRIBE_OK` would carry.
	// Absence or failure here is non-fatal; it only means we start blind.
	let acks = match catalog::fetch_acks(&broadcast).await {
		Ok(acks) => acks,
		Err(err) => {
			tracing::debug!(%err, "no acks snapshot available");
			Vec::new()
		}
	};
	for ack in &acks {
		tracing::info!(
			track = %ack.track,
			largest_group = ack.largest_group,
			largest_object = ack.largest_object,
			"largest object at subscribe time"
		);
	}

	let want_video = config.video_out.is_some() || config.mux_out.is_some();
	let want_audio = config.audio_out.is_some() || config.mux_out.is_some();

	let video = want_video
		.then(|| catalog::select(&catalog, "video", config.video.as_deref()))
		.flatten()
		.cloned();
	let audio = want_audio
		.then(|| catalog::select(&catalog, "audio", config.audio.as_deref()))
		.flatten()
		.cloned();

	if video.is_none() && audio.is_none() {
		anyhow::bail!("no matching video or audio track in catalog");
	}

	let (frame_tx, frame_rx) = mpsc::channel::<Frame>(64);
	let cancel = CancellationToken::new();

	let mut video_out = match &config.video_out {
		Some(path) => Some(Sink::open(path).await?),
		None => None,
	};
	let mut audio_out = match &config.audio_out {
		Some(path) => Some(Sink::open(path).await?),
		None => None,
	};
	let mut mux_out = match &config.mux_out {
		Some(path) => Some(Sink::open(path).await?),
		None => None,
	};

	if let (Some(sink), Some(track)) = (video_out.as_mut(), video.as_ref()) {
		sink.write(&decode_init(track)?).await?;
	}
	if let (Some(sink), Some(track)) = (audio_out.as_mut(), audio.as_ref()) {
		sink.write(&decode_init(track)?).await?;
	}
	if let Some(sink) = mux_out.as_mut() {
		let video_init = video.as_ref().map(decode_init).transpose()?;
		let audio_init = audio.as_ref().map(decode_init).transpose()?;
		let video_init = video_init.context("--mux-out requires a video track")?;
		sink.write(&Remuxer::build_init(&video_init, audio_init.as_deref())?).await?;
	}

	let mut tasks = Vec::new();

	if let Some(track) = video.clone() {
		let handle = tokio::spawn(manage_kind(
			"video",
			VIDEO_TRACK_ID,
			broadcast.clone(),
			track.name,
			config.switch_tracks.clone(),
			Duration::from_secs(config.switch_interval_secs),
			config.end_after,
			control.clone(),
			frame_tx.clone(),
			cancel.clone(),
		));
		tasks.push(handle);
	}
	if let Some(track) = audio.clone() {
		let handle = tokio::spawn(manage_kind(
			"audio",
			AUDIO_TRACK_ID,
			broadcast.clone(),
			track.name,
			None,
			Duration::from_secs(config.switch_interval_secs),
			config.end_after,
			control.clone(),
			frame_tx.clone(),
			cancel.clone(),
		));
		tasks.push(handle);
	}
	// Drop our own sender so the router's channel closes once every spawned
	// reader/manager task has finished and dropped its clone.
	drop(frame_tx);

	let router = tokio::spawn(route(frame_rx, video_out, audio_out, mux_out));

	tokio::select! {
		_ = async {
			for task in tasks {
				let _ = task.await;
			}
		} => {}
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("interrupted, closing session");
			cancel.cancel();
		}
		res = session.closed() => {
			tracing::info!(?res, "session closed by peer");
			cancel.cancel();
		}
	}

	cancel.cancel();
	router.await??;
	session.close(moq_lite::Error::Cancel);

	Ok(())
}

fn decode_init(track: &CatalogTrack) -> anyhow::Result<Vec<u8>> {
	base64::engine::general_purpose::STANDARD
		.decode(&track.init_data)
		.context("malformed base64 init segment in catalog")
}

/// Drives one media type (video or audio) for the lifetime of the session:
/// subscribes to the initially selected variant, and if `switch_to` is set,
/// alternates to it and back every `switch_interval`, performing the
/// handover algorithm in §4.7. If `end_after > 0`, issues a one-shot
/// `SUBSCRIBE_UPDATE(endGroup)` after the first object of the initial
/// subscription arrives and returns once that subscription completes.
#[allow(clippy::too_many_arguments)]
async fn manage_kind(
	kind: &'static str,
	track_id: u32,
	broadcast: BroadcastConsumer,
	initial_name: String,
	switch_to: Option<String>,
	switch_interval: Duration,
	end_after: u64,
	control: std::sync::Arc<AsyncMutex<ControlChannel>>,
	tx: mpsc::Sender<Frame>,
	cancel: CancellationToken,
) -> anyhow::Result<()> {
	let consumer = broadcast
		.subscribe_track(initial_name.as_str(), Delivery::default())
		.with_context(|| format!("failed to subscribe to {initial_name}"))?;

	let (first_tx, first_rx) = oneshot::channel();
	let mut readers = vec![tokio::spawn(read_track(track_id, consumer, tx.clone(), Some(first_tx), cancel.clone()))];

	if end_after > 0 {
		if let Ok(first_group) = first_rx.await {
			let target_end = first_group + end_after;
			tracing::info!(kind, track = %initial_name, target_end, "issuing end-after SUBSCRIBE_UPDATE");
			control.lock().await.end_after(initial_name.clone(), target_end)?;
		}
		for reader in readers {
			let _ = reader.await;
		}
		return Ok(());
	}

	let Some(switch_to) = switch_to else {
		for reader in readers {
			let _ = reader.await;
		}
		return Ok(());
	};

	let mut active_name = initial_name;
	let mut alternate_name = switch_to;

	loop {
		tokio::select! {
			_ = tokio::time::sleep(switch_interval) => {}
			_ = cancel.cancelled() => break,
		}

		let next_name = alternate_name.clone();
		alternate_name = active_name;

		tracing::info!(kind, from = %active_name, to = %next_name, "switching track");

		let next_consumer = match broadcast.subscribe_track(next_name.as_str(), Delivery::default()) {
			Ok(consumer) => consumer,
			Err(err) => {
				tracing::warn!(kind, track = %next_name, %err, "failed to subscribe during switch");
				alternate_name = active_name.clone();
				active_name = next_name;
				continue;
			}
		};

		let (next_first_tx, next_first_rx) = oneshot::channel();
		readers.push(tokio::spawn(read_track(
			track_id,
			next_consumer,
			tx.clone(),
			Some(next_first_tx),
			cancel.clone(),
		)));

		// §4.7 step 4: without a `SUBSCRIBE_OK.LargestLocation` (moq-lite's
		// track-by-name subscribe has no such handshake field), defer the cut
		// until the first object of the new subscription arrives, then cut
		// one group past it to tolerate boundary overlap.
		if let Ok(new_first_group) = next_first_rx.await {
			let cut = new_first_group + 1;
			if let Err(err) = control.lock().await.send(&livemock::control::UpdateMessage {
				track: active_name.clone(),
				end_group: Some(cut),
				priority: None,
			}) {
				tracing::warn!(kind, track = %active_name, %err, "failed to send switch-cut update");
			}
		}

		active_name = next_name;
	}

	for reader in readers {
		let _ = reader.await;
	}
	Ok(())
}

/// Reads every group/object of one subscription into `tx`, reporting the
/// first group's id on `first` (used to compute the switch handover cut and
/// the `end_after` target group). Returns once the subscription ends,
/// whether cleanly (peer `SUBSCRIBE_DONE`-equivalent close) or by error.
async fn read_track(
	track_id: u32,
	mut consumer: moq_lite::TrackConsumer,
	tx: mpsc::Sender<Frame>,
	mut first: Option<oneshot::Sender<u64>>,
	cancel: CancellationToken,
) {
	loop {
		let group = tokio::select! {
			result = consumer.next_group() => result,
			_ = cancel.cancelled() => return,
		};

		let mut group = match group {
			Ok(Some(group)) => group,
			Ok(None) => return,
			Err(err) => {
				tracing::warn!(%err, "track subscription ended with error");
				return;
			}
		};

		if let Some(first) = first.take() {
			let _ = first.send(group.info().sequence);
		}

		loop {
			let frame = tokio::select! {
				result = group.read_frame() => result,
				_ = cancel.cancelled() => return,
			};

			match frame {
				Ok(Some(payload)) => {
					if tx
						.send(Frame {
							track_id,
							group: group.info().sequence,
							payload,
						})
						.await
						.is_err()
					{
						return;
					}
				}
				Ok(None) => break,
				Err(err) => {
					tracing::warn!(%err, "group read ended with error");
					return;
				}
			}
		}
	}
}

/// Single consumer of every reader's frames: demultiplexes by `track_id` into
/// the raw per-type outputs and/or the CMAF remuxer, deduplicating objects
/// left over from a just-cut subscription during a track switch (§4.7/§9):
/// within one track kind, groups must strictly increase, so anything at or
/// below the last group written for that kind is dropped.
async fn route(
	mut rx: mpsc::Receiver<Frame>,
	mut video_out: Option<Sink>,
	mut audio_out: Option<Sink>,
	mut mux_out: Option<Sink>,
) -> anyhow::Result<()> {
	let mut remuxer = Remuxer::new();
	let mut last_group = std::collections::HashMap::<u32, u64>::new();

	while let Some(frame) = rx.recv().await {
		if let Some(&last) = last_group.get(&frame.track_id) {
			if frame.group <= last {
				tracing::debug!(track_id = frame.track_id, group = frame.group, last, "dropping superseded object");
				continue;
			}
		}
		last_group.insert(frame.track_id, frame.group);

		let raw_sink = match frame.track_id {
			VIDEO_TRACK_ID => video_out.as_mut(),
			AUDIO_TRACK_ID => audio_out.as_mut(),
			_ => None,
		};
		if let Some(sink) = raw_sink {
			sink.write(&frame.payload).await?;
		}

		if let Some(sink) = mux_out.as_mut() {
			let rewritten = remuxer.remux_fragment(frame.track_id, &frame.payload)?;
			sink.write(&rewritten).await?;
		}
	}

	Ok(())
}
