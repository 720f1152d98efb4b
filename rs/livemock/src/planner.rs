//! Pure wall-clock <-> (group, object) <-> sample-range mapping functions.
//!
//! Every function here is a pure function of a [`ContentTrack`] and a wall-clock
//! millisecond offset from the moment the publisher considers `t = 0`. None of
//! them touch the clock directly, which is what makes the publish engine's
//! scheduling (`publish.rs` in `livemock-server`) testable with
//! `tokio::time::{pause, advance}`.

use crate::model::ContentTrack;

/// Group duration in milliseconds. Fixed per spec; groups never vary in length.
pub const GROUP_DURATION_MS: u64 = 1000;

/// A half-open sample range `[start, end)` in track timescale units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRange {
	pub start: u64,
	pub end: u64,
}

impl SampleRange {
	pub fn len(&self) -> u64 {
		self.end - self.start
	}

	pub fn is_empty(&self) -> bool {
		self.end <= self.start
	}
}

fn ceil_div(num: u128, den: u128) -> u64 {
	(num.div_ceil(den)) as u64
}

/// `sampleRangeForGroup(G)`: maps a group id to a sample range, independent of any asset loop.
pub fn sample_range_for_group(track: &ContentTrack, group: u64) -> SampleRange {
	let t = track.timescale as u128;
	let d = track.sample_duration as u128;
	let p = GROUP_DURATION_MS as u128;

	let start = ceil_div(group as u128 * p * t, 1000 * d);
	let end = ceil_div((group as u128 + 1) * p * t, 1000 * d);

	SampleRange { start, end }
}

/// Number of objects in a group: `N = ceil((end - start) / B)`.
pub fn objects_in_group(track: &ContentTrack, group: u64) -> u64 {
	let range = sample_range_for_group(track, group);
	range.len().div_ceil(track.batch)
}

/// The sample range `[start, end)` covered by object `O` of group `G`.
pub fn object_sample_range(track: &ContentTrack, group: u64, object: u64) -> SampleRange {
	let group_range = sample_range_for_group(track, group);
	let start = group_range.start + object * track.batch;
	let end = (start + track.batch).min(group_range.end);
	SampleRange { start, end }
}

/// `tAvail(G, O)`: wall-clock time (ms) at which object `O` of group `G` has been
/// fully written and is available to a subscriber, per §4.5.
pub fn object_available_at(track: &ContentTrack, group: u64, object: u64) -> f64 {
	group as f64 * GROUP_DURATION_MS as f64 + track.sample_offset_ms() + (object + 1) as f64 * track.object_duration_ms()
}

/// `currentGroup(nowMs)`: the group whose opener (object 0) has most recently
/// become fully available, per §4.3. Returns 0 if `now` precedes the first
/// group's opener.
pub fn current_group(track: &ContentTrack, now_ms: f64) -> u64 {
	let opener_duration = track.sample_offset_ms() + track.object_duration_ms();
	if now_ms < opener_duration {
		return 0;
	}
	// G*1000 + opener_duration <= now_ms => G <= (now_ms - opener_duration) / 1000
	(((now_ms - opener_duration) / GROUP_DURATION_MS as f64).floor()) as u64
}

/// `largestObject(nowMs)`: the highest `(G, O)` whose object has fully arrived
/// by `now_ms`, walking backward from `current_group` if the current group has
/// not yet produced any object. Returns `(0, 0)` if nothing has arrived yet.
pub fn largest_object(track: &ContentTrack, now_ms: f64) -> (u64, u64) {
	let mut group = current_group(track, now_ms);

	loop {
		let n = objects_in_group(track, group);
		if n == 0 {
			if group == 0 {
				return (0, 0);
			}
			group -= 1;
			continue;
		}

		// Walk objects within this group from the newest to the oldest.
		for object in (0..n).rev() {
			if object_available_at(track, group, object) <= now_ms {
				return (group, object);
			}
		}

		if group == 0 {
			return (0, 0);
		}
		group -= 1;
	}
}

/// Wraps a logical (unbounded) sample number into the asset's looped timeline,
/// per §4.3's wrap-around rule. Returns the index into the track's stored
/// samples (always `< loop_len_samples`).
pub fn wrap_sample(track: &ContentTrack, logical_sample: u64) -> u64 {
	let d = track.sample_duration;
	let l = track.loop_duration_units;

	let tau = logical_sample * d;
	let wraps = tau / l;
	let aligned = (wraps * l).div_ceil(d) * d;
	(tau - aligned) / d
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{CodecConfig, TrackKind};

	#[test]
	fn object_ranges_tile_the_group_range() {
		let track = video_track(25, 1, 5, 10_000);
		let group_range = sample_range_for_group(&track, 3);
		let n = objects_in_group(&track, 3);

		let mut covered = group_range.start;
		for o in 0..n {
			let r = object_sample_range(&track, 3, o);
			assert_eq!(r.start, covered);
			covered = r.end;
		}
		assert_eq!(covered, group_range.end);
	}

	fn video_track(timescale: u32, sample_duration: u64, batch: u64, loop_ms: u64) -> ContentTrack {
		ContentTrack {
			name: "400kbps".into(),
			kind: TrackKind::Video,
			timescale,
			sample_duration,
			gop: Some(timescale as u64 / sample_duration),
			batch,
			lang: "und".into(),
			codec: CodecConfig::Avc {
				sps: Default::default(),
				pps: Default::default(),
				profile: 0x64,
				constraints: 0,
				level: 0x1f,
			},
			samples: Vec::new(),
			loop_duration_units: loop_ms * timescale as u64 / 1000,
			sample_bitrate: 400_000,
			width: Some(1920),
			height: Some(1080),
			sample_rate: None,
			channel_count: None,
			alt_group: 0,
			render_group: 0,
		}
	}

	#[test]
	fn group_ranges_are_contiguous_and_cover_every_sample() {
		let track = video_track(25, 1, 1, 10_000);

		for g in 0..20u64 {
			let this = sample_range_for_group(&track, g);
			let next = sample_range_for_group(&track, g + 1);
			assert!(next.start >= this.end, "group {g} overlaps group {}", g + 1);
		}

		// K groups must cover every sample in [0, ceil(K*P*T/(1000*D))).
		let k = 7u64;
		let covered = sample_range_for_group(&track, k - 1).end;
		let expected = ceil_div(k as u128 * GROUP_DURATION_MS as u128 * track.timescale as u128, 1000 * track.sample_duration as u128);
		assert_eq!(covered, expected);
	}

	#[test]
	fn largest_object_is_monotonic() {
		let track = video_track(25, 1, 1, 10_000);
		let mut prev = (0u64, 0u64);
		for ms in (0..6000u64).step_by(17) {
			let cur = largest_object(&track, ms as f64);
			assert!(cur >= prev, "largest_object went backward: {prev:?} -> {cur:?} at t={ms}");
			prev = cur;
		}
	}

	#[test]
	fn largest_object_opener_boundary() {
		let track = video_track(25, 1, 1, 10_000);
		for g in 0..5u64 {
			let opener_end = object_available_at(&track, g, 0);
			assert_eq!(largest_object(&track, opener_end), (g, 0));
		}
	}

	#[test]
	fn object_available_matches_worked_video_example() {
		// spec.md S1: 25fps AVC, GOP 25, batch 1. First object of group 4 is not
		// available before t=4040ms (40ms object duration, no sample offset).
		let track = video_track(25, 1, 1, 10_000);
		assert_eq!(current_group(&track, 3500.0), 3);
		assert_eq!(object_available_at(&track, 4, 0), 4040.0);
	}

	#[test]
	fn wrap_sample_is_periodic() {
		let track = video_track(25, 1, 1, 2000); // 50-sample loop
		let loop_len = track.loop_len_samples();
		for n in 0..300u64 {
			assert_eq!(wrap_sample(&track, n), wrap_sample(&track, n + loop_len));
			assert!(wrap_sample(&track, n) < loop_len);
		}
	}
}
