//! Issues `SUBSCRIBE_UPDATE`-equivalent messages over livemock's control
//! channel (§4.7): one `UpdateMessage` per call, each its own single-object
//! group, matching what the server's `serve_control` task expects.

use livemock::control::{UpdateMessage, CONTROL_BROADCAST, CONTROL_TRACK};
use moq_lite::{Broadcast, Group, OriginProducer, Time};

/// Owns the broadcast a subscriber publishes its own track-update requests
/// under, since `moq-lite` sessions have no peer-addressable `request_id`.
pub struct ControlChannel {
	track: moq_lite::TrackProducer,
	next_group: u64,
}

impl ControlChannel {
	/// Builds the control broadcast and registers it with `origin`, the
	/// producer half of the `Origin` whose consumer is passed to the
	/// session's `with_publish`.
	pub fn new(origin: &mut OriginProducer) -> anyhow::Result<Self> {
		let broadcast = Broadcast::produce();
		let mut producer = broadcast.producer;
		let track = producer.create_track(CONTROL_TRACK, moq_lite::Delivery::default())?;
		origin.publish_broadcast(CONTROL_BROADCAST, producer.consume());

		Ok(Self { track, next_group: 0 })
	}

	pub fn send(&mut self, update: &UpdateMessage) -> anyhow::Result<()> {
		let json = update.to_json()?;
		let sequence = self.next_group;
		self.next_group += 1;

		let mut group = self.track.create_group(Group { sequence })?;
		group.write_frame(json, Time::from_millis_unchecked(0))?;
		group.close()?;
		Ok(())
	}

	pub fn end_after(&mut self, track: impl Into<String>, end_group: u64) -> anyhow::Result<()> {
		self.send(&UpdateMessage::end_after(track, end_group))
	}
}
