//! Unifies CMAF content tracks and synthesized subtitle tracks behind one
//! interface so the publish engine (in `livemock-server`) can drive either
//! without caring which kind of track it's serving.

use bytes::Bytes;

use crate::cmaf;
use crate::error::Result;
use crate::model::ContentTrack;
use crate::planner::{self, GROUP_DURATION_MS};
use crate::subtitle::{self, SubtitleCodec};

/// Anything the publish engine can synthesize one fragment of, per group/object.
pub trait PublishSource: Send + Sync {
	/// The MoQ track name this source is published under.
	fn name(&self) -> &str;

	/// Number of objects in `group`.
	fn objects_in_group(&self, group: u64) -> u64;

	/// Wall-clock time (ms) at which `(group, object)` becomes available.
	fn object_available_at(&self, group: u64, object: u64) -> f64;

	/// The group whose opener has most recently become available at `now_ms`.
	fn current_group(&self, now_ms: f64) -> u64;

	/// The highest `(group, object)` available at `now_ms`.
	fn largest_object(&self, now_ms: f64) -> (u64, u64);

	/// Synthesizes the fragment bytes for `(group, object)`.
	fn build_fragment(&self, group: u64, object: u64, sequence: u32) -> Result<Bytes>;
}

impl PublishSource for ContentTrack {
	fn name(&self) -> &str {
		&self.name
	}

	fn objects_in_group(&self, group: u64) -> u64 {
		planner::objects_in_group(self, group)
	}

	fn object_available_at(&self, group: u64, object: u64) -> f64 {
		planner::object_available_at(self, group, object)
	}

	fn current_group(&self, now_ms: f64) -> u64 {
		planner::current_group(self, now_ms)
	}

	fn largest_object(&self, now_ms: f64) -> (u64, u64) {
		planner::largest_object(self, now_ms)
	}

	fn build_fragment(&self, group: u64, object: u64, sequence: u32) -> Result<Bytes> {
		let range = planner::object_sample_range(self, group, object);
		let fragment = cmaf::build_fragment(self, sequence, range.start, range.end)?;
		Ok(fragment.bytes)
	}
}

/// A dynamically-synthesized subtitle track: exactly one object per group,
/// spanning the whole group's wall-clock second. There is no backing asset.
pub struct SubtitleSource {
	pub codec: SubtitleCodec,
	pub lang: String,
	/// Wall-clock unix time (ms) that `now_ms = 0` corresponds to, so cue text
	/// carries a real RFC3339 timestamp even though groups are numbered from
	/// process startup.
	pub epoch_ms: u64,
}

impl SubtitleSource {
	pub fn new(codec: SubtitleCodec, lang: impl Into<String>, epoch_ms: u64) -> Self {
		Self {
			codec,
			lang: lang.into(),
			epoch_ms,
		}
	}

	pub fn track_name(&self) -> String {
		self.codec.track_name(&self.lang)
	}
}

impl PublishSource for SubtitleSource {
	fn name(&self) -> &str {
		// track_name() allocates; callers needing the MoQ track name should use
		// `track_name()` directly. `name()` exists to satisfy the trait and is
		// only used for logging, where a static label is fine.
		"subtitle"
	}

	fn objects_in_group(&self, _group: u64) -> u64 {
		1
	}

	fn object_available_at(&self, group: u64, object: u64) -> f64 {
		debug_assert_eq!(object, 0);
		(group + 1) as f64 * GROUP_DURATION_MS as f64
	}

	fn current_group(&self, now_ms: f64) -> u64 {
		if now_ms < GROUP_DURATION_MS as f64 {
			return 0;
		}
		((now_ms - GROUP_DURATION_MS as f64) / GROUP_DURATION_MS as f64).floor() as u64
	}

	fn largest_object(&self, now_ms: f64) -> (u64, u64) {
		let group = self.current_group(now_ms);
		if self.object_available_at(group, 0) <= now_ms {
			(group, 0)
		} else if group == 0 {
			(0, 0)
		} else {
			(group - 1, 0)
		}
	}

	fn build_fragment(&self, group: u64, _object: u64, sequence: u32) -> Result<Bytes> {
		subtitle::build_subtitle_fragment(self.codec, &self.lang, group, sequence, self.epoch_ms)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn subtitle_source_has_one_object_per_group() {
		let source = SubtitleSource::new(SubtitleCodec::Wvtt, "en", 0);
		assert_eq!(source.objects_in_group(0), 1);
		assert_eq!(source.object_available_at(0, 0), 1000.0);
		assert_eq!(source.current_group(999.0), 0);
		assert_eq!(source.current_group(1000.0), 1);
	}

	#[test]
	fn subtitle_largest_object_tracks_group_boundary() {
		let source = SubtitleSource::new(SubtitleCodec::Stpp, "en", 0);
		assert_eq!(source.largest_object(500.0), (0, 0));
		assert_eq!(source.largest_object(1000.0), (1, 0));
		assert_eq!(source.largest_object(1999.0), (1, 0));
	}
}
