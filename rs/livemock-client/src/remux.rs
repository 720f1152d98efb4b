//! CMAF remux output (§4.7 supplement): combines independently-synthesized
//! video and audio CMAF streams into a single two-track fMP4, mirroring the
//! teacher's `hang::import::fmp4::Fmp4` importer run in reverse — instead of
//! demultiplexing an fMP4 into MoQ tracks, this remultiplexes MoQ fragments
//! back into one fMP4.
//!
//! Every catalog variant already carries compatible in-band parameter sets
//! (§4.1), so no SPS/PPS rewriting is needed here: rewriting each fragment's
//! `tfhd.track_id` and renumbering `mfhd.sequence_number` is enough, and the
//! `mdat` payload is copied through untouched.

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use mp4_atom::{Any, Atom, DecodeMaybe, Encode, Ftyp, Moov, Mvex, Trex};

pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;

/// Assembles one combined init segment, then renumbers every subsequent
/// fragment's track id to slot into it.
pub struct Remuxer {
	sequence: u32,
}

impl Remuxer {
	pub fn new() -> Self {
		Self { sequence: 0 }
	}

	/// Builds the combined `ftyp+moov` from each variant's own (single-track)
	/// init segment. `audio_init` is omitted for a video-only subscription.
	pub fn build_init(video_init: &[u8], audio_init: Option<&[u8]>) -> anyhow::Result<Bytes> {
		let (ftyp, mut video_moov) = decode_init(video_init)?;
		let mut video_trak = video_moov.trak.pop().context("video init segment has no track")?;
		video_trak.tkhd.track_id = VIDEO_TRACK_ID;

		let video_trex = video_moov.mvex.as_ref().and_then(|mvex| mvex.trex.first()).cloned();
		let mut traks = vec![video_trak];
		let mut trexs = vec![Trex {
			track_id: VIDEO_TRACK_ID,
			default_sample_description_index: 1,
			default_sample_duration: video_trex.as_ref().map(|t| t.default_sample_duration).unwrap_or_default(),
			default_sample_size: 0,
			default_sample_flags: video_trex.as_ref().map(|t| t.default_sample_flags).unwrap_or_default(),
		}];

		if let Some(audio_init) = audio_init {
			let (_, mut audio_moov) = decode_init(audio_init)?;
			let mut audio_trak = audio_moov.trak.pop().context("audio init segment has no track")?;
			audio_trak.tkhd.track_id = AUDIO_TRACK_ID;

			let audio_trex = audio_moov.mvex.as_ref().and_then(|mvex| mvex.trex.first()).cloned();
			traks.push(audio_trak);
			trexs.push(Trex {
				track_id: AUDIO_TRACK_ID,
				default_sample_description_index: 1,
				default_sample_duration: audio_trex.as_ref().map(|t| t.default_sample_duration).unwrap_or_default(),
				default_sample_size: 0,
				default_sample_flags: audio_trex.as_ref().map(|t| t.default_sample_flags).unwrap_or_default(),
			});
		}

		let moov = Moov {
			mvhd: video_moov.mvhd.clone(),
			trak: traks,
			mvex: Some(Mvex { mehd: None, trex: trexs }),
			udta: None,
			..Default::default()
		};

		let mut out = BytesMut::new();
		ftyp.encode(&mut out)?;
		moov.encode(&mut out)?;
		Ok(out.freeze())
	}

	/// Rewrites one synthesized fragment's `tfhd.track_id` to `track_id` and
	/// assigns the next muxed sequence number. The `mdat` payload passes
	/// through byte-for-byte since both rewritten fields are fixed-width,
	/// leaving every `trun.data_offset` valid.
	pub fn remux_fragment(&mut self, track_id: u32, fragment: &[u8]) -> anyhow::Result<Bytes> {
		let mut cursor = fragment;
		let mut moof = None;

		while let Some(atom) = Any::decode_maybe(&mut cursor)? {
			if let Any::Moof(m) = atom {
				moof = Some(m);
				break;
			}
		}
		let mut moof = moof.context("fragment does not start with a moof box")?;
		let consumed = fragment.len() - cursor.len();
		let mdat = &fragment[consumed..];

		self.sequence += 1;
		moof.mfhd.sequence_number = self.sequence;
		for traf in &mut moof.traf {
			traf.tfhd.track_id = track_id;
		}

		let mut out = BytesMut::new();
		moof.encode(&mut out)?;
		out.extend_from_slice(mdat);
		Ok(out.freeze())
	}
}

impl Default for Remuxer {
	fn default() -> Self {
		Self::new()
	}
}

fn decode_init(bytes: &[u8]) -> anyhow::Result<(Ftyp, Moov)> {
	let mut cursor = bytes;
	let mut ftyp = None;
	let mut moov = None;

	while let Some(atom) = Any::decode_maybe(&mut cursor)? {
		match atom {
			Any::Ftyp(f) => ftyp = Some(f),
			Any::Moov(m) => moov = Some(m),
			_ => {}
		}
	}

	Ok((ftyp.context("init segment missing ftyp")?, moov.context("init segment missing moov")?))
}

#[cfg(test)]
mod tests {
	use super::*;
	use livemock::cmaf::init_segment;
	use livemock::model::{CodecConfig, ContentTrack, Sample, TrackKind};

	fn video_track() -> ContentTrack {
		ContentTrack {
			name: "400kbps".into(),
			kind: TrackKind::Video,
			timescale: 25,
			sample_duration: 1,
			gop: Some(25),
			batch: 1,
			lang: "und".into(),
			codec: CodecConfig::Avc {
				sps: Bytes::from_static(&[0x67, 0x42]),
				pps: Bytes::from_static(&[0x68, 0xCE]),
				profile: 0x64,
				constraints: 0,
				level: 0x28,
			},
			samples: vec![Sample {
				data: Bytes::from_static(&[0xAA]),
				sync: true,
			}],
			loop_duration_units: 1,
			sample_bitrate: 400_000,
			width: Some(640),
			height: Some(360),
			sample_rate: None,
			channel_count: None,
			alt_group: 0,
			render_group: 0,
		}
	}

	fn audio_track() -> ContentTrack {
		ContentTrack {
			name: "audio_128k".into(),
			kind: TrackKind::Audio,
			timescale: 48_000,
			sample_duration: 1024,
			gop: None,
			batch: 1,
			lang: "und".into(),
			codec: CodecConfig::Aac {
				asc: Bytes::from_static(&[0x12, 0x10]),
				object_type: 2,
			},
			samples: vec![Sample {
				data: Bytes::from_static(&[0xBB]),
				sync: true,
			}],
			loop_duration_units: 1,
			sample_bitrate: 128_000,
			width: None,
			height: None,
			sample_rate: Some(48_000),
			channel_count: Some(2),
			alt_group: 0,
			render_group: 0,
		}
	}

	#[test]
	fn combined_init_renumbers_tracks() {
		let video_init = init_segment(&video_track()).unwrap();
		let audio_init = init_segment(&audio_track()).unwrap();

		let combined = Remuxer::build_init(&video_init, Some(&audio_init)).unwrap();
		let (_, moov) = decode_init(&combined).unwrap();

		assert_eq!(moov.trak.len(), 2);
		assert_eq!(moov.trak[0].tkhd.track_id, VIDEO_TRACK_ID);
		assert_eq!(moov.trak[1].tkhd.track_id, AUDIO_TRACK_ID);
		assert_eq!(moov.mvex.unwrap().trex.len(), 2);
	}

	#[test]
	fn video_only_init_has_one_track() {
		let video_init = init_segment(&video_track()).unwrap();
		let combined = Remuxer::build_init(&video_init, None).unwrap();
		let (_, moov) = decode_init(&combined).unwrap();
		assert_eq!(moov.trak.len(), 1);
	}

	#[test]
	fn remuxed_fragment_carries_the_new_track_id() {
		use livemock::cmaf::build_fragment;

		let track = video_track();
		let frag = build_fragment(&track, 0, 0, 1).unwrap();

		let mut remuxer = Remuxer::new();
		let rewritten = remuxer.remux_fragment(AUDIO_TRACK_ID, &frag.bytes).unwrap();

		let mut cursor: &[u8] = &rewritten;
		let moof = loop {
			match Any::decode_maybe(&mut cursor).unwrap().unwrap() {
				Any::Moof(m) => break m,
				_ => continue,
			}
		};
		assert_eq!(moof.traf[0].tfhd.track_id, AUDIO_TRACK_ID);
		assert_eq!(moof.mfhd.sequence_number, 1);
	}

	#[test]
	fn sequence_numbers_increase_monotonically() {
		let track = video_track();
		let frag_a = build_fragment_helper(&track, 0);
		let frag_b = build_fragment_helper(&track, 1);

		let mut remuxer = Remuxer::new();
		let out_a = remuxer.remux_fragment(VIDEO_TRACK_ID, &frag_a).unwrap();
		let out_b = remuxer.remux_fragment(VIDEO_TRACK_ID, &frag_b).unwrap();

		assert!(out_b.len() == out_a.len());
		assert_eq!(remuxer.sequence, 2);
	}

	fn build_fragment_helper(track: &ContentTrack, seq: u32) -> Bytes {
		livemock::cmaf::build_fragment(track, seq, 0, 1).unwrap().bytes
	}
}
