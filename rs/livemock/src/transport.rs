//! Adapts the generic `moq-lite` pub/sub primitives to the per-subscription,
//! `endGroup`-aware wire semantics this system needs (§4.5/§4.6/§4.7).
//!
//! `moq-lite`'s [`moq_lite::TrackProducer`] fans a single track out to every
//! consumer identically; there is no per-consumer `SUBSCRIBE_UPDATE` cutoff.
//! To get that, each [`Subscription`] owns a dedicated `TrackProducer` /
//! `TrackConsumer` pair scoped to exactly one subscriber, and the publish
//! engine writes the same fragment bytes into every live subscription's
//! producer. This keeps the wire-level track name and group/object shape
//! identical to a genuine shared broadcast while giving each subscriber an
//! independently truncatable stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moq_lite::{Group as MoqGroup, Track as MoqTrack, TrackConsumer, TrackProducer};

/// Mirrors the IETF MoQ Transport draft's `FILTER_TYPE`; this system only
/// implements `NextGroupStart` (§4.6 rejects anything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
	NextGroupStart,
	LatestObject,
	AbsoluteStart,
	AbsoluteRange,
}

/// `(group, object)`, as sent in `SUBSCRIBE_OK.LargestLocation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location {
	pub group: u64,
	pub object: u64,
}

/// Error codes this system emits in `SUBSCRIBE_ERROR`, per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeErrorCode {
	Policy,
	TrackDoesNotExist,
	Internal,
}

#[derive(Debug, Clone)]
pub struct SubscribeRequest {
	pub session_id: u64,
	pub request_id: u64,
	pub namespace: Vec<String>,
	pub track: String,
	pub filter_type: FilterType,
	pub subscriber_priority: u8,
}

#[derive(Debug, Clone)]
pub struct SubscribeOk {
	pub largest: Location,
	pub expires: Option<Duration>,
	pub content_exists: bool,
}

#[derive(Debug, Clone)]
pub struct SubscribeUpdate {
	pub request_id: u64,
	pub end_group: Option<u64>,
	pub subscriber_priority: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneStatus {
	Completed,
	InternalError,
}

#[derive(Debug, Clone)]
pub struct SubscribeDone {
	pub status: DoneStatus,
	pub reason: String,
}

impl SubscribeDone {
	pub fn completed() -> Self {
		Self {
			status: DoneStatus::Completed,
			reason: "Subscription completed successfully".to_string(),
		}
	}
}

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Issues the next monotonically increasing session id, mirroring the
/// teacher's `conn_id` counter in its relay session bookkeeping.
pub fn next_session_id() -> u64 {
	SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A live subscription to one track, owned by exactly one per-track publisher.
///
/// Holds a dedicated `moq-lite` track producer/consumer pair so that this
/// subscriber's stream can be truncated at `end_group` independently of any
/// other subscriber to the same named track.
pub struct Subscription {
	pub session_id: u64,
	pub request_id: u64,
	pub track_name: String,
	pub start_group: u64,
	pub start_object: u64,
	pub priority: u8,
	pub end_group: Option<u64>,
	pub last_sent: Option<Location>,
	producer: TrackProducer,
	consumer: TrackConsumer,
	current_subgroup: Option<moq_lite::GroupProducer>,
}

impl Subscription {
	pub fn new(session_id: u64, req: &SubscribeRequest, start_group: u64) -> Self {
		let track = MoqTrack {
			name: req.track.clone(),
			priority: req.subscriber_priority,
			max_latency: Duration::ZERO,
		};
		let produced = track.produce();

		Self {
			session_id,
			request_id: req.request_id,
			track_name: req.track.clone(),
			start_group,
			start_object: 0,
			priority: req.subscriber_priority,
			end_group: None,
			last_sent: None,
			producer: produced.producer,
			consumer: produced.consumer,
			current_subgroup: None,
		}
	}

	/// Wraps a [`TrackProducer`] already created by `moq-lite` for a single
	/// subscriber — e.g. the one handed back by
	/// [`moq_lite::BroadcastProducer::requested_track`]. Used by the session
	/// layer, which never sees a raw `SubscribeRequest` because the real
	/// `moq-lite` wire protocol doesn't expose filter types or request ids;
	/// it only ever asks for a named track.
	pub fn adopt(session_id: u64, request_id: u64, track_name: &str, start_group: u64, priority: u8, producer: TrackProducer) -> Self {
		Self {
			session_id,
			request_id,
			track_name: track_name.to_string(),
			start_group,
			start_object: 0,
			priority,
			end_group: None,
			last_sent: None,
			consumer: producer.consume(),
			producer,
			current_subgroup: None,
		}
	}

	/// Hands the read side to the session layer, which streams it to the peer.
	pub fn consumer(&self) -> TrackConsumer {
		self.consumer.clone()
	}

	/// Hands the write side to the session layer, so it can be published into
	/// a session's broadcast under `track_name` for the peer to subscribe to.
	pub fn producer(&self) -> TrackProducer {
		self.producer.clone()
	}

	/// True once `group` has reached or passed the subscription's `end_group`.
	pub fn is_past_end(&self, group: u64) -> bool {
		self.end_group.is_some_and(|end| group >= end)
	}

	pub fn apply_update(&mut self, update: &SubscribeUpdate) {
		if let Some(end_group) = update.end_group {
			self.end_group = Some(end_group);
		}
		if let Some(priority) = update.subscriber_priority {
			self.priority = priority;
		}
	}

	/// Opens subgroup `(group, 0)` at the subscription's priority, per §4.5.1.a.
	pub fn open_group(&mut self, group: u64) -> Result<(), moq_lite::Error> {
		let producer = self.producer.create_group(MoqGroup { sequence: group })?;
		self.current_subgroup = Some(producer);
		Ok(())
	}

	/// Writes object `object`'s fragment bytes into the currently open subgroup.
	pub fn write_object(&mut self, object: u64, payload: bytes::Bytes) -> Result<(), moq_lite::Error> {
		let subgroup = self
			.current_subgroup
			.as_mut()
			.expect("open_group must be called before write_object");
		subgroup.write_frame(payload, moq_lite::Time::from_millis_unchecked(object))?;
		Ok(())
	}

	/// Closes the currently open subgroup and records the last object sent.
	pub fn close_group(&mut self, group: u64, last_object: u64) {
		self.current_subgroup = None;
		self.last_sent = Some(Location {
			group,
			object: last_object,
		});
	}

	/// Closes the session's track producer, signalling `SUBSCRIBE_DONE` to the peer.
	pub fn finish(&mut self) {
		let _ = self.producer.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request(track: &str) -> SubscribeRequest {
		SubscribeRequest {
			session_id: 0,
			request_id: 1,
			namespace: vec!["live".into()],
			track: track.into(),
			filter_type: FilterType::NextGroupStart,
			subscriber_priority: 5,
		}
	}

	#[test]
	fn apply_update_only_touches_set_fields() {
		let req = request("400kbps");
		let mut sub = Subscription::new(0, &req, 4);
		sub.apply_update(&SubscribeUpdate {
			request_id: 1,
			end_group: Some(10),
			subscriber_priority: None,
		});
		assert_eq!(sub.end_group, Some(10));
		assert_eq!(sub.priority, 5);
	}

	#[test]
	fn is_past_end_respects_exclusive_bound() {
		let req = request("400kbps");
		let mut sub = Subscription::new(0, &req, 0);
		sub.end_group = Some(10);
		assert!(!sub.is_past_end(9));
		assert!(sub.is_past_end(10));
	}

	#[test]
	fn session_ids_are_monotonic() {
		let a = next_session_id();
		let b = next_session_id();
		assert!(b > a);
	}
}
