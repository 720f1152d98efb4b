//! Session/Subscription Manager (§4.5/§4.6): one `Session` per accepted MoQ
//! connection. Announces the live namespace, services each `SUBSCRIBE` by
//! adopting the track producer `moq-lite` hands back, and relays
//! `SUBSCRIBE_UPDATE`s delivered over livemock's control-channel broadcast.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use livemock::control::{SubscribeAck, UpdateMessage, ACKS_TRACK, CONTROL_BROADCAST, CONTROL_TRACK};
use livemock::transport::Subscription;
use moq_lite::{Broadcast, Delivery, Origin, Time};
use moq_native::Request;
use tokio_util::sync::CancellationToken;

use crate::publish::TrackPublisher;

/// The process-wide set of publishable tracks, built once at startup.
pub struct Registry {
	pub namespace: String,
	pub catalog_json: Bytes,
	pub tracks: HashMap<String, Arc<TrackPublisher>>,
	pub epoch: Instant,
}

impl Registry {
	fn remove_session(&self, session_id: u64) {
		for publisher in self.tracks.values() {
			publisher.remove_subscription(session_id);
		}
	}
}

pub struct Session {
	pub id: u64,
	pub request: Request,
	pub registry: Arc<Registry>,
}

impl Session {
	#[tracing::instrument("session", skip_all, fields(id = self.id))]
	pub async fn run(self) -> anyhow::Result<()> {
		let broadcast = Broadcast::produce();
		let origin = Origin::produce();
		origin.producer.publish_broadcast(self.registry.namespace.as_str(), broadcast.consumer);

		// We don't serve any broadcasts the peer publishes except the
		// control channel, so scope our consume-side origin to just that name.
		let control_origin = Origin::produce();

		let session = self
			.request
			.with_publish(origin.consumer)
			.with_consume(control_origin.producer)
			.accept()
			.await?;

		tracing::info!("session accepted");

		let cancel = CancellationToken::new();

		let requests = tokio::spawn(serve_requests(
			self.id,
			broadcast.producer,
			self.registry.clone(),
			cancel.clone(),
		));
		let control = tokio::spawn(serve_control(self.id, control_origin.consumer, self.registry.clone()));

		let result = session.closed().await;

		cancel.cancel();
		requests.abort();
		control.abort();
		self.registry.remove_session(self.id);

		result.map_err(Into::into)
	}
}

/// Drains `SUBSCRIBE` requests for this session's broadcast, one per
/// distinct track name a peer asks for, adopting the producer `moq-lite`
/// hands back into either a one-shot catalog write or a live subscription.
async fn serve_requests(
	session_id: u64,
	mut broadcast: moq_lite::BroadcastProducer,
	registry: Arc<Registry>,
	cancel: CancellationToken,
) {
	let mut next_request_id: u64 = 0;

	loop {
		let producer = tokio::select! {
			result = broadcast.requested_track() => match result {
				Ok(Some(producer)) => producer,
				_ => return,
			},
			_ = cancel.cancelled() => return,
		};

		let request_id = next_request_id;
		next_request_id += 1;

		let name = producer.info().name.to_string();

		if name == livemock::catalog::CATALOG_TRACK_NAME {
			write_catalog(producer, registry.catalog_json.clone());
			continue;
		}

		if name == ACKS_TRACK {
			let now_ms = registry.epoch.elapsed().as_secs_f64() * 1000.0;
			write_acks(producer, &registry, now_ms);
			continue;
		}

		let Some(publisher) = registry.tracks.get(&name).cloned() else {
			tracing::warn!(session_id, track = %name, "rejecting subscribe to unknown track");
			let mut producer = producer;
			let _ = producer.abort(moq_lite::Error::NotFound);
			continue;
		};

		let now_ms = registry.epoch.elapsed().as_secs_f64() * 1000.0;
		// The current group is already in flight (and may be partially
		// served); a new subscriber joins at the next one so it never sees a
		// group cut short by its own late arrival.
		let start_group = publisher.current_group(now_ms) + 1;

		// `TrackInfo` only carries the name; the priority `moq-lite` assigned
		// the producer from the peer's request isn't surfaced past this
		// point, so subscriptions start at a neutral default and rely on the
		// control channel's `priority` field for renegotiation.
		let subscription = Subscription::adopt(session_id, request_id, &name, start_group, DEFAULT_SUBSCRIBER_PRIORITY, producer);
		publisher.add_subscription(subscription);
	}
}

const DEFAULT_SUBSCRIBER_PRIORITY: u8 = 0;

/// Writes the catalog as a single-object, single-group track and leaves the
/// producer open forever; the catalog never changes after startup (§4.5).
fn write_catalog(mut producer: moq_lite::TrackProducer, json: Bytes) {
	let result = (|| -> Result<(), moq_lite::Error> {
		let mut group = producer.create_group(moq_lite::Group { sequence: 0 })?;
		group.write_frame(json, Time::from_millis_unchecked(0))?;
		group.close()?;
		Ok(())
	})();

	if let Err(err) = result {
		tracing::warn!(%err, "failed to write catalog");
	}
}

/// Writes a one-shot snapshot of every track's `LargestLocation` as a single
/// JSON frame, the same way [`write_catalog`] serves the catalog. A
/// subscriber reads this once at startup to learn where the live edge is
/// before issuing its real track subscriptions.
fn write_acks(mut producer: moq_lite::TrackProducer, registry: &Registry, now_ms: f64) {
	let acks: Vec<SubscribeAck> = registry
		.tracks
		.values()
		.map(|publisher| {
			let (largest_group, largest_object) = publisher.largest_object(now_ms);
			SubscribeAck {
				track: publisher.name().to_string(),
				largest_group,
				largest_object,
				content_exists: true,
			}
		})
		.collect();

	let json = match serde_json::to_vec(&acks) {
		Ok(json) => json,
		Err(err) => {
			tracing::warn!(%err, "failed to serialize acks snapshot");
			return;
		}
	};

	let result = (|| -> Result<(), moq_lite::Error> {
		let mut group = producer.create_group(moq_lite::Group { sequence: 0 })?;
		group.write_frame(Bytes::from(json), Time::from_millis_unchecked(0))?;
		group.close()?;
		Ok(())
	})();

	if let Err(err) = result {
		tracing::warn!(%err, "failed to write acks snapshot");
	}
}

/// Watches for the subscriber's `control` broadcast (if they publish one),
/// subscribes to its `updates` track, and forwards parsed messages into the
/// matching track publisher.
async fn serve_control(session_id: u64, mut origin: moq_lite::OriginConsumer, registry: Arc<Registry>) {
	while let Some((path, broadcast)) = origin.announced().await {
		if path.as_str() != CONTROL_BROADCAST {
			continue;
		}
		let Some(broadcast) = broadcast else { continue };
		let Ok(mut consumer) = broadcast.subscribe_track(CONTROL_TRACK, Delivery::default()) else {
			continue;
		};
		let registry = registry.clone();
		tokio::spawn(async move {
			while let Ok(Some(mut group)) = consumer.next_group().await {
				while let Ok(Some(frame)) = group.read_frame().await {
					match UpdateMessage::from_json(&frame) {
						Ok(update) => {
							if let Some(publisher) = registry.tracks.get(&update.track) {
								publisher.apply_update(session_id, &update);
							}
						}
						Err(err) => tracing::warn!(session_id, %err, "malformed control update"),
					}
				}
			}
		});
	}
}
