//! Dynamic WVTT/STPP subtitle cue synthesis (§4.4). Subtitle tracks have no
//! backing samples; every fragment is generated on demand from the group id
//! and the wall-clock instant it represents.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use mp4_atom::{Encode, Mdat, Mfhd, Moof, Tfdt, Tfhd, Traf, Trun, TrunEntry};

use crate::cmaf::TRACK_ID;
use crate::error::Result;
use crate::planner::GROUP_DURATION_MS;

/// Wire codec for a dynamic subtitle track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleCodec {
	Wvtt,
	Stpp,
}

impl SubtitleCodec {
	pub fn track_name(&self, lang: &str) -> String {
		match self {
			SubtitleCodec::Wvtt => format!("subs_wvtt_{lang}"),
			SubtitleCodec::Stpp => format!("subs_stpp_{lang}"),
		}
	}

	pub fn codec_string(&self) -> &'static str {
		match self {
			SubtitleCodec::Wvtt => "wvtt",
			SubtitleCodec::Stpp => "stpp.ttml.im1t",
		}
	}
}

const CUE_DURATION_MS: u64 = 900;

/// Nominal per-object bitrate used for the catalog `bitrate` field (§4.2):
/// a cue plus its filler is a few hundred bytes once per one-second group,
/// far below any real media track's contribution to the stream's bandwidth.
pub const SUBTITLE_SAMPLE_BITRATE: u64 = 800;

fn write_box(out: &mut BytesMut, fourcc: &[u8; 4], body: &[u8]) {
	out.put_u32(8 + body.len() as u32);
	out.put_slice(fourcc);
	out.put_slice(body);
}

fn write_full_box(out: &mut BytesMut, fourcc: &[u8; 4], version: u8, flags: u32, body: &[u8]) {
	let mut full = BytesMut::with_capacity(4 + body.len());
	full.put_u8(version);
	full.put_uint(flags as u64, 3);
	full.extend_from_slice(body);
	write_box(out, fourcc, &full);
}

/// Packs a language tag into the 16-bit ISO-639-2/T code `mdhd` expects
/// (three 5-bit letters biased by `0x60`), defaulting to `und` for anything
/// that isn't three lowercase ASCII letters.
fn pack_language(lang: &str) -> u16 {
	let mut code = [b'u', b'n', b'd'];
	for (slot, byte) in code.iter_mut().zip(lang.bytes()) {
		let lower = byte.to_ascii_lowercase();
		if lower.is_ascii_lowercase() {
			*slot = lower;
		}
	}
	code.iter().fold(0u16, |acc, &b| (acc << 5) | ((b - 0x60) as u16 & 0x1F))
}

/// Builds the `ftyp + moov` init segment for a dynamic subtitle track.
///
/// Neither `wvtt` nor `stpp` sample entries exist in `mp4-atom`'s typed
/// `Codec` enum, so every box is assembled by hand the same way the cue
/// payloads below are, rather than going through `cmaf::build_stsd`.
pub fn subtitle_init_segment(codec: SubtitleCodec, lang: &str) -> Result<Bytes> {
	let mut out = BytesMut::new();

	let mut ftyp_body = BytesMut::new();
	ftyp_body.put_slice(b"iso5");
	ftyp_body.put_u32(512);
	for brand in [b"iso5", b"iso6", b"mp41", b"cmfc"] {
		ftyp_body.put_slice(brand);
	}
	write_box(&mut out, b"ftyp", &ftyp_body);

	let mut moov_body = BytesMut::new();
	write_mvhd(&mut moov_body);
	write_trak(&mut moov_body, codec, lang);
	write_mvex(&mut moov_body);
	write_box(&mut out, b"moov", &moov_body);

	Ok(out.freeze())
}

const UNITY_MATRIX: [i32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

fn write_mvhd(out: &mut BytesMut) {
	let mut body = BytesMut::new();
	body.put_u32(0); // creation_time
	body.put_u32(0); // modification_time
	body.put_u32(SUBTITLE_TIMESCALE);
	body.put_u32(0); // duration
	body.put_i32(0x0001_0000); // rate, 1.0
	body.put_i16(0x0100); // volume, 1.0
	body.put_u16(0); // reserved
	body.put_u32(0); // reserved
	body.put_u32(0); // reserved
	for v in UNITY_MATRIX {
		body.put_i32(v);
	}
	for _ in 0..6 {
		body.put_u32(0); // pre_defined
	}
	body.put_u32(TRACK_ID + 1); // next_track_ID
	write_full_box(out, b"mvhd", 0, 0, &body);
}

fn write_trak(out: &mut BytesMut, codec: SubtitleCodec, lang: &str) {
	let mut body = BytesMut::new();
	write_tkhd(&mut body);
	write_mdia(&mut body, codec, lang);
	write_box(out, b"trak", &body);
}

fn write_tkhd(out: &mut BytesMut) {
	let mut body = BytesMut::new();
	body.put_u32(0); // creation_time
	body.put_u32(0); // modification_time
	body.put_u32(TRACK_ID);
	body.put_u32(0); // reserved
	body.put_u32(0); // duration
	body.put_u32(0); // reserved
	body.put_u32(0); // reserved
	body.put_i16(0); // layer
	body.put_i16(0); // alternate_group
	body.put_i16(0); // volume: 0 for a non-audio track
	body.put_u16(0); // reserved
	for v in UNITY_MATRIX {
		body.put_i32(v);
	}
	body.put_u32(0); // width: no visual presentation
	body.put_u32(0); // height
	// flags: track_enabled | track_in_movie | track_in_preview
	write_full_box(out, b"tkhd", 0, 0x0000_0007, &body);
}

fn write_mdia(out: &mut BytesMut, codec: SubtitleCodec, lang: &str) {
	let mut body = BytesMut::new();
	write_mdhd(&mut body, lang);
	write_hdlr(&mut body, codec);
	write_minf(&mut body, codec);
	write_box(out, b"mdia", &body);
}

fn write_mdhd(out: &mut BytesMut, lang: &str) {
	let mut body = BytesMut::new();
	body.put_u32(0); // creation_time
	body.put_u32(0); // modification_time
	body.put_u32(SUBTITLE_TIMESCALE);
	body.put_u32(0); // duration
	body.put_u16(pack_language(lang));
	body.put_u16(0); // pre_defined
	write_full_box(out, b"mdhd", 0, 0, &body);
}

/// Handler type per ISO/IEC 14496-30: `text` for WebVTT, `subt` for TTML.
fn write_hdlr(out: &mut BytesMut, codec: SubtitleCodec) {
	let mut body = BytesMut::new();
	body.put_u32(0); // pre_defined
	let handler: &[u8; 4] = match codec {
		SubtitleCodec::Wvtt => b"text",
		SubtitleCodec::Stpp => b"subt",
	};
	body.put_slice(handler);
	body.put_u32(0); // reserved
	body.put_u32(0); // reserved
	body.put_u32(0); // reserved
	body.put_slice(b"livemock\0");
	write_full_box(out, b"hdlr", 0, 0, &body);
}

fn write_minf(out: &mut BytesMut, codec: SubtitleCodec) {
	let _ = codec;
	let mut body = BytesMut::new();
	// Subtitle Media Header box (ISO/IEC 14496-12 Amd.2): empty full box.
	write_full_box(&mut body, b"sthd", 0, 0, &[]);
	write_dinf(&mut body);
	write_stbl(&mut body, codec);
	write_box(out, b"minf", &body);
}

fn write_dinf(out: &mut BytesMut) {
	let mut url_box = BytesMut::new();
	write_full_box(&mut url_box, b"url ", 0, 0x0000_0001, &[]); // self-contained

	let mut dref_body = BytesMut::new();
	dref_body.put_u32(1); // entry_count
	dref_body.extend_from_slice(&url_box);

	let mut dref_box = BytesMut::new();
	write_full_box(&mut dref_box, b"dref", 0, 0, &dref_body);

	write_box(out, b"dinf", &dref_box);
}

fn write_stbl(out: &mut BytesMut, codec: SubtitleCodec) {
	let mut body = BytesMut::new();
	write_stsd(&mut body, codec);
	write_full_box(&mut body, b"stts", 0, 0, &0u32.to_be_bytes());
	write_full_box(&mut body, b"stsc", 0, 0, &0u32.to_be_bytes());
	let mut stsz_body = BytesMut::new();
	stsz_body.put_u32(0); // sample_size: variable
	stsz_body.put_u32(0); // sample_count
	write_full_box(&mut body, b"stsz", 0, 0, &stsz_body);
	write_full_box(&mut body, b"stco", 0, 0, &0u32.to_be_bytes());
	write_box(out, b"stbl", &body);
}

fn write_stsd(out: &mut BytesMut, codec: SubtitleCodec) {
	let mut entry = BytesMut::new();
	write_sample_entry(&mut entry, codec);

	let mut body = BytesMut::new();
	body.put_u32(1); // entry_count
	body.extend_from_slice(&entry);
	write_full_box(out, b"stsd", 0, 0, &body);
}

fn write_sample_entry(out: &mut BytesMut, codec: SubtitleCodec) {
	let mut body = BytesMut::new();
	body.put_bytes(0, 6); // reserved
	body.put_u16(1); // data_reference_index

	match codec {
		SubtitleCodec::Wvtt => {
			// WebVTTConfigurationBox: a minimal valid WebVTT header, per
			// ISO/IEC 14496-30.
			write_box(&mut body, b"vttC", b"WEBVTT\n\n");
			write_box(out, b"wvtt", &body);
		}
		SubtitleCodec::Stpp => {
			// XMLSubtitleSampleEntry: namespace, schema_location, and
			// auxiliary_mime_types, each a null-terminated UTF-8 string.
			body.put_slice(b"http://www.w3.org/ns/ttml\0");
			body.put_u8(0); // schema_location: none
			body.put_u8(0); // auxiliary_mime_types: none
			write_box(out, b"stpp", &body);
		}
	}
}

fn write_mvex(out: &mut BytesMut) {
	let mut trex_body = BytesMut::new();
	trex_body.put_u32(TRACK_ID);
	trex_body.put_u32(1); // default_sample_description_index
	trex_body.put_u32(CUE_DURATION_MS as u32); // default_sample_duration
	trex_body.put_u32(0); // default_sample_size
	trex_body.put_u32(0); // default_sample_flags

	let mut trex_box = BytesMut::new();
	write_full_box(&mut trex_box, b"trex", 0, 0, &trex_body);

	write_box(out, b"mvex", &trex_box);
}

/// Builds a `vttc` sample containing one `payl` (and `sttg` when the cue is
/// non-empty) for the given text.
fn wvtt_cue_sample(text: Option<&str>) -> Bytes {
	let mut vttc_body = BytesMut::new();

	if let Some(text) = text {
		let mut payl = BytesMut::new();
		write_box(&mut payl, b"payl", text.as_bytes());

		let mut sttg = BytesMut::new();
		write_box(&mut sttg, b"sttg", b"line:0%");

		vttc_body.extend_from_slice(&sttg);
		vttc_body.extend_from_slice(&payl);
	}

	let mut out = BytesMut::new();
	write_box(&mut out, b"vttc", &vttc_body);
	out.freeze()
}

fn stpp_cue_sample(lang: &str, cues: &[(u64, u64, String)]) -> Bytes {
	fn fmt_ts(ms: u64) -> String {
		let h = ms / 3_600_000;
		let m = (ms / 60_000) % 60;
		let s = (ms / 1_000) % 60;
		let frac = ms % 1_000;
		format!("{h:02}:{m:02}:{s:02}.{frac:03}")
	}

	let mut paragraphs = String::new();
	for (start, end, text) in cues {
		paragraphs.push_str(&format!(
			"<p begin=\"{}\" end=\"{}\">{}</p>",
			fmt_ts(*start),
			fmt_ts(*end),
			text
		));
	}

	let doc = format!(
		concat!(
			"<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
			"<tt xmlns=\"http://www.w3.org/ns/ttml\" xml:lang=\"{lang}\">",
			"<body><div>{paragraphs}</div></body></tt>"
		),
		lang = lang,
		paragraphs = paragraphs,
	);

	Bytes::from(doc.into_bytes())
}

/// Cue text for group `group`, starting at wall-clock `group * 1000` ms:
/// `"<RFC3339 UTC>\n<lang> # <groupNr>"`, per §4.4/S6.
fn cue_text(lang: &str, group: u64, at_ms: u64) -> String {
	let dt = DateTime::<Utc>::from_timestamp_millis(at_ms as i64).unwrap_or_else(Utc::now);
	format!("{}\n{} # {}", dt.to_rfc3339(), lang, group)
}

/// Builds the `moof+mdat` fragment for one 1-second subtitle group.
///
/// The group's window is `[group*1000, (group+1)*1000)` absolute wall-clock
/// milliseconds, though `epoch_ms` lets callers anchor group 0 to process
/// startup rather than the Unix epoch.
pub fn build_subtitle_fragment(codec: SubtitleCodec, lang: &str, group: u64, sequence_number: u32, epoch_ms: u64) -> Result<Bytes> {
	let group_start = epoch_ms + group * GROUP_DURATION_MS;
	let text = cue_text(lang, group, group_start);

	// One 900ms cue, then a 100ms empty filler cue so the fragment covers the
	// full 1-second group with no gap, per §4.4.
	let cue_sample = match codec {
		SubtitleCodec::Wvtt => wvtt_cue_sample(Some(&text)),
		SubtitleCodec::Stpp => stpp_cue_sample(lang, &[(0, CUE_DURATION_MS, text.clone())]),
	};
	let filler_sample = match codec {
		SubtitleCodec::Wvtt => wvtt_cue_sample(None),
		SubtitleCodec::Stpp => stpp_cue_sample(lang, &[]),
	};

	let samples = [
		(CUE_DURATION_MS as u32, cue_sample),
		((GROUP_DURATION_MS - CUE_DURATION_MS) as u32, filler_sample),
	];

	build_text_fragment(&samples, group, sequence_number)
}

/// Timescale for dynamic subtitle tracks: milliseconds, so `tfdt`/`trun`
/// durations are directly wall-clock millisecond counts.
pub const SUBTITLE_TIMESCALE: u32 = 1000;

fn build_text_fragment(samples: &[(u32, Bytes)], group: u64, sequence_number: u32) -> Result<Bytes> {
	let mut entries = Vec::with_capacity(samples.len());
	let mut mdat = BytesMut::new();

	for (duration, data) in samples {
		entries.push(TrunEntry {
			duration: Some(*duration),
			size: Some(data.len() as u32),
			flags: None,
			cts: None,
		});
		mdat.extend_from_slice(data);
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
		base_media_decode_time: group * GROUP_DURATION_MS,
	};
	let mut trun = Trun {
		data_offset: Some(0),
		entries,
	};

	let probe = Moof {
		mfhd: Mfhd { sequence_number },
		traf: vec![Traf {
			tfhd: tfhd.clone(),
			tfdt: Some(tfdt.clone()),
			trun: vec![trun.clone()],
			..Default::default()
		}],
	};
	let mut probe_bytes = BytesMut::new();
	probe.encode(&mut probe_bytes)?;
	trun.data_offset = Some((probe_bytes.len() + 8) as i32);

	let moof = Moof {
		mfhd: Mfhd { sequence_number },
		traf: vec![Traf {
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
	Ok(out.freeze())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wvtt_fragment_contains_expected_cue_text() {
		let frag = build_subtitle_fragment(SubtitleCodec::Wvtt, "en", 1000, 0, 0).unwrap();
		let text = String::from_utf8_lossy(&frag);
		assert!(text.contains("en # 1000"));
	}

	#[test]
	fn stpp_fragment_is_valid_ttml() {
		let frag = build_subtitle_fragment(SubtitleCodec::Stpp, "en", 5, 0, 0).unwrap();
		let text = String::from_utf8_lossy(&frag);
		assert!(text.contains("xml:lang=\"en\""));
		assert!(text.contains("en # 5"));
	}

	#[test]
	fn track_names_follow_convention() {
		assert_eq!(SubtitleCodec::Wvtt.track_name("en"), "subs_wvtt_en");
		assert_eq!(SubtitleCodec::Stpp.track_name("fr"), "subs_stpp_fr");
	}

	#[test]
	fn wvtt_init_segment_carries_the_sample_entry() {
		let init = subtitle_init_segment(SubtitleCodec::Wvtt, "en").unwrap();
		assert!(!init.is_empty());
		assert_eq!(&init[4..8], b"ftyp");
		let text = String::from_utf8_lossy(&init);
		assert!(text.contains("wvtt"));
		assert!(text.contains("WEBVTT"));
	}

	#[test]
	fn stpp_init_segment_carries_the_sample_entry() {
		let init = subtitle_init_segment(SubtitleCodec::Stpp, "fr").unwrap();
		let text = String::from_utf8_lossy(&init);
		assert!(text.contains("stpp"));
		assert!(text.contains("ttml"));
	}

	#[test]
	fn pack_language_defaults_to_und_when_empty() {
		assert_eq!(pack_language(""), pack_language("und"));
	}
}
