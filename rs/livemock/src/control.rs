//! App-level control channel carrying `SUBSCRIBE_UPDATE(endGroup=...)`
//! semantics that the real `moq-lite` wire protocol has no room for.
//!
//! `moq-lite` tracks are anonymous byte streams; there is no `request_id`
//! the subscriber can reuse to address a prior subscription. Instead, a
//! subscriber that wants to truncate or reprioritize a running subscription
//! publishes a tiny broadcast named `control`, containing one track named
//! `updates`, and writes one JSON-encoded [`UpdateMessage`] per group as a
//! single-object group. The session layer on the other end watches for this
//! broadcast and forwards parsed messages into the matching [`crate::transport::Subscription`].

use serde::{Deserialize, Serialize};

/// Broadcast name a subscriber publishes its control channel under.
pub const CONTROL_BROADCAST: &str = "control";

/// Track name within the `control` broadcast carrying [`UpdateMessage`]s.
pub const CONTROL_TRACK: &str = "updates";

/// Track name, served alongside `catalog` on the live broadcast, carrying a
/// one-shot snapshot of every track's `SUBSCRIBE_OK.LargestLocation`. Real
/// `moq-lite` subscribes have no field to carry this back to the subscriber,
/// so it's published as its own readable track instead.
pub const ACKS_TRACK: &str = "acks";

/// One track's largest-available-object snapshot, standing in for the
/// `LargestLocation`/`ContentExists` fields a `SUBSCRIBE_OK` would carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeAck {
	pub track: String,
	pub largest_group: u64,
	pub largest_object: u64,
	pub content_exists: bool,
}

/// One `SUBSCRIBE_UPDATE`, addressed by track name since there is no
/// `request_id` shared between session and subscriber in `moq-lite`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
	pub track: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub end_group: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub priority: Option<u8>,
}

impl UpdateMessage {
	pub fn end_after(track: impl Into<String>, end_group: u64) -> Self {
		Self {
			track: track.into(),
			end_group: Some(end_group),
			priority: None,
		}
	}

	pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
		serde_json::to_vec(self)
	}

	pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
		serde_json::from_slice(bytes)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_through_json() {
		let msg = UpdateMessage::end_after("400kbps", 42);
		let bytes = msg.to_json().unwrap();
		let back = UpdateMessage::from_json(&bytes).unwrap();
		assert_eq!(msg, back);
	}

	#[test]
	fn omits_unset_fields() {
		let msg = UpdateMessage {
			track: "400kbps".into(),
			end_group: None,
			priority: Some(3),
		};
		let json = String::from_utf8(msg.to_json().unwrap()).unwrap();
		assert!(!json.contains("end_group"));
		assert!(json.contains("priority"));
	}
}
