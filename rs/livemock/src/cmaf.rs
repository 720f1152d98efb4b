//! CMAF fragment assembly (§4.4): init segments and `moof+mdat` chunks.

use bytes::{Bytes, BytesMut};
use mp4_atom::{
	Avc1, AvcC, Co64, Encode, Esds, Ftyp, Hdlr, Mdat, Mdhd, Mdia, Minf, Moof, Moov, Mp4a, Mvex, Mvhd, Smhd, Stbl, Stco,
	Stsc, Stsd, Stsz, Stts, Tfdt, Tfhd, Trak, Trex, Trun, TrunEntry, Tkhd, Vmhd,
};

use crate::error::{Error, Result};
use crate::model::{CodecConfig, ContentTrack, TrackKind};
use crate::planner::{sample_range_for_group, wrap_sample};

/// Track id baked into every `tfhd`/`tkhd`; this system publishes one media
/// track per MoQ track, so the in-box id is always 1.
pub const TRACK_ID: u32 = 1;

/// Samples-per-batch default sample flags: non-sync by default, overridden
/// per-entry for sync samples.
const NON_SYNC_FLAGS: u32 = 0x0101_0000; // sample_depends_on=1, is_non_sync=1
const SYNC_FLAGS: u32 = 0x0200_0000; // sample_depends_on=2 (no other), is_non_sync=0

fn handler_name(kind: TrackKind) -> &'static [u8; 4] {
	match kind {
		TrackKind::Video => b"vide",
		TrackKind::Audio => b"soun",
		TrackKind::Subtitle => b"text",
	}
}

/// Builds the `ftyp + moov` init segment for one track.
pub fn init_segment(track: &ContentTrack) -> Result<Bytes> {
	let ftyp = Ftyp {
		major_brand: *b"iso5",
		minor_version: 512,
		compatible_brands: vec![*b"iso5", *b"iso6", *b"mp41", *b"cmfc"],
	};

	let stsd = build_stsd(track)?;

	let trak = Trak {
		tkhd: Tkhd {
			track_id: TRACK_ID,
			duration: 0,
			width: track.width.map(|w| w as u32).unwrap_or_default().into(),
			height: track.height.map(|h| h as u32).unwrap_or_default().into(),
			..Default::default()
		},
		mdia: Mdia {
			mdhd: Mdhd {
				timescale: track.timescale,
				duration: 0,
				language: track.lang.clone(),
				..Default::default()
			},
			hdlr: Hdlr {
				handler: (*handler_name(track.kind)).into(),
				name: "livemock".to_string(),
			},
			minf: Minf {
				vmhd: matches!(track.kind, TrackKind::Video).then(Vmhd::default),
				smhd: matches!(track.kind, TrackKind::Audio).then(Smhd::default),
				stbl: Stbl {
					stsd,
					stts: Stts::default(),
					stsc: Stsc::default(),
					stsz: Stsz::default(),
					stco: Stco::default(),
					co64: None::<Co64>,
					..Default::default()
				},
				..Default::default()
			},
		},
		edts: None,
		..Default::default()
	};

	let moov = Moov {
		mvhd: Mvhd {
			timescale: 1000,
			duration: 0,
			..Default::default()
		},
		trak: vec![trak],
		mvex: Some(Mvex {
			mehd: None,
			trex: vec![Trex {
				track_id: TRACK_ID,
				default_sample_description_index: 1,
				default_sample_duration: track.sample_duration as u32,
				default_sample_size: 0,
				default_sample_flags: NON_SYNC_FLAGS,
			}],
		}),
		udta: None,
		..Default::default()
	};

	let mut out = BytesMut::new();
	ftyp.encode(&mut out)?;
	moov.encode(&mut out)?;
	Ok(out.freeze())
}

fn build_stsd(track: &ContentTrack) -> Result<Stsd> {
	use mp4_atom::Codec;

	let codec = match &track.codec {
		CodecConfig::Avc {
			sps,
			pps,
			profile,
			constraints,
			level,
		} => {
			let avcc = AvcC {
				configuration_version: 1,
				avc_profile_indication: *profile,
				profile_compatibility: *constraints,
				avc_level_indication: *level,
				length_size: 4,
				sps: vec![sps.to_vec()],
				pps: vec![pps.to_vec()],
				ext: None,
			};

			Codec::Avc1(Avc1 {
				visual: mp4_atom::Visual {
					width: track.width.unwrap_or_default(),
					height: track.height.unwrap_or_default(),
					..Default::default()
				},
				avcc,
			})
		}
		CodecConfig::Aac { asc, .. } => {
			let esds = Esds { codec_specific: asc.to_vec() };
			Codec::Mp4a(Mp4a {
				audio: mp4_atom::Audio {
					channel_count: track.channel_count.unwrap_or(2),
					sample_size: 16,
					sample_rate: (track.sample_rate.unwrap_or(48_000) as f64).into(),
				},
				esds,
			})
		}
	};

	Ok(Stsd { codecs: vec![codec] })
}

/// One synthesized `moof + mdat` CMAF fragment.
pub struct Fragment {
	pub bytes: Bytes,
	/// The un-wrapped decode time of the first sample, in track timescale units.
	pub base_decode_time: u64,
}

/// Builds the CMAF fragment covering one object: samples `[start, end)` of
/// `group`'s sample range, wrapped into the loop timeline, per §4.3/§4.4.
pub fn build_fragment(track: &ContentTrack, sequence_number: u32, start: u64, end: u64) -> Result<Fragment> {
	if track.samples.is_empty() {
		return Err(Error::EmptyAsset);
	}

	let mut entries = Vec::with_capacity((end - start) as usize);
	let mut mdat = BytesMut::new();

	for n in start..end {
		let idx = wrap_sample(track, n) as usize;
		let sample = track
			.samples
			.get(idx)
			.ok_or_else(|| Error::EmptyAsset)?;

		entries.push(TrunEntry {
			duration: Some(track.sample_duration as u32),
			size: Some(sample.data.len() as u32),
			flags: Some(if sample.sync { SYNC_FLAGS } else { NON_SYNC_FLAGS }),
			cts: Some(0),
		});
		mdat.extend_from_slice(&sample.data);
	}

	let tfhd = Tfhd {
		track_id: TRACK_ID,
		base_data_offset: None,
		sample_description_index: None,
		default_sample_duration: None,
		default_sample_size: None,
		default_sample_flags: None,
		duration_is_empty: false,
		default_base_is_moof: true,
	};

	let tfdt = Tfdt {
		base_media_decode_time: start * track.sample_duration,
	};

	// `trun.data_offset` is the byte offset from the start of the moof to the
	// first sample's data, i.e. moof_len + mdat header (8 bytes).
	let mut trun = Trun {
		data_offset: Some(0),
		entries,
	};

	let moof_skeleton = Moof {
		mfhd: mp4_atom::Mfhd { sequence_number },
		traf: vec![mp4_atom::Traf {
			tfhd: tfhd.clone(),
			tfdt: Some(tfdt.clone()),
			trun: vec![trun.clone()],
			..Default::default()
		}],
	};

	let mut probe = BytesMut::new();
	moof_skeleton.encode(&mut probe)?;
	trun.data_offset = Some((probe.len() + 8) as i32);

	let moof = Moof {
		mfhd: mp4_atom::Mfhd { sequence_number },
		traf: vec![mp4_atom::Traf {
			tfhd,
			tfdt: Some(tfdt),
			trun: vec![trun],
			..Default::default()
		}],
	};

	let mdat = Mdat { data: mdat.to_vec() };

	let mut out = BytesMut::new();
	moof.encode(&mut out)?;
	mdat.encode(&mut out)?;

	Ok(Fragment {
		bytes: out.freeze(),
		base_decode_time: start * track.sample_duration,
	})
}

/// Builds every object fragment for one group, per the batching described in §4.3/§4.4.
pub fn build_group_fragments(track: &ContentTrack, group: u64, sequence_base: u32) -> Result<Vec<Fragment>> {
	let range = sample_range_for_group(track, group);
	let mut fragments = Vec::new();

	let mut n = range.start;
	let mut seq = sequence_base;
	while n < range.end {
		let batch_end = (n + track.batch).min(range.end);
		fragments.push(build_fragment(track, seq, n, batch_end)?);
		n = batch_end;
		seq += 1;
	}

	Ok(fragments)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::Sample;
	use bytes::Bytes as B;

	fn track_with_samples(n: usize) -> ContentTrack {
		let samples = (0..n)
			.map(|i| Sample {
				data: B::from(vec![0xAAu8; 4]),
				sync: i % 25 == 0,
			})
			.collect();

		ContentTrack {
			name: "400kbps".into(),
			kind: TrackKind::Video,
			timescale: 25,
			sample_duration: 1,
			gop: Some(25),
			batch: 1,
			lang: "und".into(),
			codec: CodecConfig::Avc {
				sps: B::from_static(&[0x67, 0x42]),
				pps: B::from_static(&[0x68, 0xCE]),
				profile: 0x42,
				constraints: 0,
				level: 0x1f,
			},
			samples,
			loop_duration_units: n as u64,
			sample_bitrate: 400_000,
			width: Some(640),
			height: Some(360),
			sample_rate: None,
			channel_count: None,
			alt_group: 0,
			render_group: 0,
		}
	}

	#[test]
	fn fragment_base_decode_time_is_unwrapped() {
		let track = track_with_samples(50);
		// Group 3 covers samples [75, 100) in the unwrapped timeline, which wrap
		// into a 50-sample loop, but tfdt must carry the un-wrapped value.
		let frag = build_fragment(&track, 0, 75, 76).unwrap();
		assert_eq!(frag.base_decode_time, 75);
	}

	#[test]
	fn group_fragments_are_monotonically_increasing_in_decode_time() {
		let track = track_with_samples(50);
		let frags = build_group_fragments(&track, 2, 0).unwrap();
		let mut last = None;
		for frag in &frags {
			if let Some(prev) = last {
				assert!(frag.base_decode_time > prev);
			}
			last = Some(frag.base_decode_time);
		}
	}

	#[test]
	fn init_segment_round_trips_avc_parameter_sets() {
		let track = track_with_samples(50);
		let init = init_segment(&track).unwrap();
		assert!(!init.is_empty());
	}
}
