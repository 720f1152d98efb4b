//! Reads a directory of fragmented CMAF seed files and builds the immutable
//! [`Asset`] every other component is built from (§4.1).

mod aac;
mod avc;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use mp4_atom::{Any, Atom, Codec, DecodeMaybe};

use crate::error::{Error, Result};
use crate::model::{Asset, CodecConfig, ContentTrack, Sample, TrackGroup, TrackKind};

pub use aac::EditListEntry;

/// How many samples the CMAF chunk generator batches per object, per media kind.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
	pub video: u64,
	pub audio: u64,
}

impl Default for BatchConfig {
	fn default() -> Self {
		Self { video: 1, audio: 1 }
	}
}

struct DecodedFile {
	samples: Vec<(u64, Bytes)>, // (decode_time, data)
	sample_duration: u64,
	timescale: u32,
	lang: String,
	kind: TrackKind,
	codec: Codec,
	length_size: usize,
	edit_list: Option<EditListEntry>,
}

fn decode_file(path: &Path, bytes: &[u8]) -> Result<DecodedFile> {
	let file = path.display().to_string();
	let mut cursor = bytes;

	let mut moov = None;
	let mut samples: Vec<(u64, Bytes)> = Vec::new();
	let mut pending_moof: Option<mp4_atom::Moof> = None;

	while let Some(atom) = Any::decode_maybe(&mut cursor).map_err(Error::from)? {
		match atom {
			Any::Moov(m) => moov = Some(m),
			Any::Moof(moof) => pending_moof = Some(moof),
			Any::Mdat(mdat) => {
				let moof = pending_moof.take().ok_or_else(|| Error::NotFragmented { file: file.clone() })?;
				extract_samples(&moof, &mdat.data, &mut samples)?;
			}
			_ => {}
		}
	}

	let moov = moov.ok_or_else(|| Error::NotFragmented { file: file.clone() })?;
	if moov.trak.len() != 1 {
		return Err(Error::MultipleTracks {
			file: file.clone(),
			count: moov.trak.len(),
		});
	}
	let trak = &moov.trak[0];
	let timescale = trak.mdia.mdhd.timescale;
	let lang = trak.mdia.mdhd.language.clone();
	let handler = trak.mdia.hdlr.handler.as_ref();

	let stsd = &trak.mdia.minf.stbl.stsd;
	let codec = stsd.codecs.first().cloned().ok_or_else(|| Error::UnsupportedCodec {
		file: file.clone(),
		codec: "<none>".to_string(),
	})?;

	let kind = match handler {
		b"vide" => TrackKind::Video,
		b"soun" => TrackKind::Audio,
		_ => {
			return Err(Error::UnsupportedCodec {
				file: file.clone(),
				codec: String::from_utf8_lossy(handler).to_string(),
			})
		}
	};

	let length_size = match &codec {
		Codec::Avc1(avc1) => avc1.avcc.length_size as usize,
		_ => 4,
	};

	let edit_list = trak.edts.as_ref().and_then(|edts| edts.elst.first()).map(|entry| EditListEntry {
		media_time: entry.media_time,
	});

	let sample_duration = validate_constant_duration(&file, &samples)?;

	Ok(DecodedFile {
		samples,
		sample_duration,
		timescale,
		lang,
		kind,
		codec,
		length_size,
		edit_list,
	})
}

/// Every sample's duration must be identical except optionally the last, per §4.1.
fn validate_constant_duration(file: &str, samples: &[(u64, Bytes)]) -> Result<u64> {
	if samples.len() < 2 {
		return Ok(0);
	}
	let expected = samples[1].0 - samples[0].0;
	for (i, window) in samples.windows(2).enumerate() {
		let found = window[1].0 - window[0].0;
		if found != expected && i + 2 != samples.len() {
			return Err(Error::InconsistentSampleDuration {
				file: file.to_string(),
				index: i + 1,
				found,
				expected,
			});
		}
	}
	Ok(expected)
}

fn extract_samples(moof: &mp4_atom::Moof, mdat: &[u8], out: &mut Vec<(u64, Bytes)>) -> Result<()> {
	for traf in &moof.traf {
		let tfdt = traf.tfdt.as_ref().map(|t| t.base_media_decode_time).unwrap_or(0);
		let mut decode_time = tfdt;
		let mut offset = 0usize;

		for trun in &traf.trun {
			for entry in &trun.entries {
				let duration = entry.duration.unwrap_or_default() as u64;
				let size = entry.size.unwrap_or_default() as usize;
				if offset + size > mdat.len() {
					break;
				}
				out.push((decode_time, Bytes::copy_from_slice(&mdat[offset..offset + size])));
				offset += size;
				decode_time += duration;
			}
		}
	}
	Ok(())
}

/// Scans sync (IDR) samples to find the constant GOP length, per §4.1.
fn validate_gop(file: &str, samples: &[Sample]) -> Result<Option<u64>> {
	let syncs: Vec<usize> = samples.iter().enumerate().filter(|(_, s)| s.sync).map(|(i, _)| i).collect();
	if syncs.len() < 2 {
		return Ok(None);
	}
	let expected = (syncs[1] - syncs[0]) as u64;
	for window in syncs.windows(2) {
		let found = (window[1] - window[0]) as u64;
		if found != expected {
			return Err(Error::InconsistentGop {
				file: file.to_string(),
				index: window[1],
				found,
				expected,
			});
		}
	}
	Ok(Some(expected))
}

/// Loads every fragmented CMAF file directly under `dir`, one file per variant.
///
/// Files are grouped into [`TrackGroup`]s by a `{basename}_{bitrate}` naming
/// convention (e.g. `video_400kbps.mp4`, `video_600kbps.mp4` share the
/// `video` alt-group; `audio_128kbps.mp4` is its own group). Variants within
/// a group are sorted ascending by sample bitrate, per §3.
pub async fn load_asset(dir: &Path, batch: BatchConfig) -> Result<Asset> {
	let mut entries = tokio::fs::read_dir(dir).await?;
	let mut files = Vec::new();
	while let Some(entry) = entries.next_entry().await? {
		let path = entry.path();
		if path.extension().and_then(|e| e.to_str()) == Some("mp4") {
			files.push(path);
		}
	}
	files.sort();

	if files.is_empty() {
		return Err(Error::EmptyAsset);
	}

	let mut by_group: HashMap<String, Vec<ContentTrack>> = HashMap::new();
	let mut group_order: Vec<String> = Vec::new();
	let mut reference_loop_ms: Option<u64> = None;

	for (index, path) in files.iter().enumerate() {
		let track = load_track(path, index, &batch).await?;

		let loop_ms = loop_duration_ms(&track);
		match reference_loop_ms {
			None => reference_loop_ms = Some(loop_ms),
			Some(reference) if track.kind == TrackKind::Audio && loop_ms > reference => {
				// Audio in non-first groups may be longer; it's clamped below.
			}
			Some(reference) if loop_ms != reference => {
				return Err(Error::InconsistentLoopDuration {
					file: path.display().to_string(),
					found: loop_ms,
					expected: reference,
				});
			}
			_ => {}
		}

		let group_key = alt_group_key(path);
		if !by_group.contains_key(&group_key) {
			group_order.push(group_key.clone());
		}
		by_group.entry(group_key).or_default().push(track);
	}

	let reference_loop_ms = reference_loop_ms.unwrap_or_default();

	let groups = group_order
		.into_iter()
		.enumerate()
		.map(|(alt_group, key)| {
			let mut variants = by_group.remove(&key).unwrap_or_default();
			variants.sort_by_key(|t| t.sample_bitrate);
			for variant in &mut variants {
				variant.alt_group = alt_group as u32;
				variant.render_group = 0;
				variant.loop_duration_units = reference_loop_ms * variant.timescale as u64 / 1000;

				// Audio in non-first groups may be longer than the reference
				// loop (see the comment above); clamp the stored samples to
				// match, not just the duration used to compute wrap points.
				let loop_len = variant.loop_len_samples();
				if (variant.samples.len() as u64) > loop_len {
					variant.samples.truncate(loop_len as usize);
				}
			}
			TrackGroup {
				alt_group: alt_group as u32,
				variants,
			}
		})
		.collect();

	Ok(Asset {
		groups,
		loop_duration_ms: reference_loop_ms,
	})
}

fn alt_group_key(path: &Path) -> String {
	path.file_stem()
		.and_then(|s| s.to_str())
		.and_then(|s| s.split('_').next())
		.unwrap_or("track")
		.to_string()
}

fn loop_duration_ms(track: &ContentTrack) -> u64 {
	1000 * track.samples.len() as u64 * track.sample_duration / track.timescale as u64
}

async fn load_track(path: &PathBuf, index: usize, batch: &BatchConfig) -> Result<ContentTrack> {
	let bytes = tokio::fs::read(path).await?;
	let file = path.display().to_string();
	let decoded = decode_file(path, &bytes)?;

	let name = path
		.file_stem()
		.and_then(|s| s.to_str())
		.map(|s| s.to_string())
		.unwrap_or_else(|| format!("track{index}"));

	let (samples, codec, batch_count) = match (&decoded.kind, &decoded.codec) {
		(TrackKind::Video, Codec::Avc1(avc1)) => {
			let raw: Vec<Bytes> = decoded.samples.iter().map(|(_, d)| d.clone()).collect();
			let (rewritten, sps, pps) = avc::prepare_avc_samples(&file, &raw, decoded.length_size, &avc1.avcc.sps, &avc1.avcc.pps)?;
			let (profile, constraints, level) = avc::codec_components(&sps)?;

			let samples: Vec<Sample> = rewritten
				.into_iter()
				.enumerate()
				.map(|(i, data)| Sample {
					data,
					sync: is_sync_by_nal(&decoded.samples[i].1, decoded.length_size),
				})
				.collect();

			(
				samples,
				CodecConfig::Avc {
					sps,
					pps,
					profile,
					constraints,
					level,
				},
				batch.video,
			)
		}
		(TrackKind::Audio, Codec::Mp4a(mp4a)) => {
			let asc = Bytes::from(mp4a.esds.codec_specific.clone());
			let object_type = aac::audio_object_type(&asc)?;
			let samples = aac::absorb_edit_list(decoded.samples.clone(), decoded.edit_list, decoded.sample_duration);

			(samples, CodecConfig::Aac { asc, object_type }, batch.audio)
		}
		_ => {
			return Err(Error::UnsupportedCodec {
				file: file.clone(),
				codec: format!("{:?}", decoded.codec),
			})
		}
	};

	let gop = validate_gop(&file, &samples)?;
	let sample_bitrate = estimate_bitrate(&samples, decoded.timescale, decoded.sample_duration);

	let (width, height) = match &decoded.codec {
		Codec::Avc1(avc1) => (Some(avc1.visual.width), Some(avc1.visual.height)),
		_ => (None, None),
	};
	let (sample_rate, channel_count) = match &decoded.codec {
		Codec::Mp4a(mp4a) => (Some(mp4a.audio.sample_rate.integer() as u32), Some(mp4a.audio.channel_count)),
		_ => (None, None),
	};

	Ok(ContentTrack {
		name,
		kind: decoded.kind,
		timescale: decoded.timescale,
		sample_duration: decoded.sample_duration,
		gop,
		batch: batch_count,
		lang: decoded.lang,
		codec,
		samples,
		loop_duration_units: 0, // filled in once the reference loop duration is known
		sample_bitrate,
		width,
		height,
		sample_rate,
		channel_count,
		alt_group: 0,
		render_group: 0,
	})
}

fn is_sync_by_nal(original_sample: &Bytes, length_size: usize) -> bool {
	let mut pos = 0;
	while pos + length_size <= original_sample.len() {
		let len = match length_size {
			4 => u32::from_be_bytes(original_sample[pos..pos + 4].try_into().unwrap()) as usize,
			2 => u16::from_be_bytes(original_sample[pos..pos + 2].try_into().unwrap()) as usize,
			_ => return false,
		};
		pos += length_size;
		if pos + len > original_sample.len() {
			break;
		}
		if original_sample[pos] & 0x1f == 5 {
			return true;
		}
		pos += len;
	}
	false
}

fn estimate_bitrate(samples: &[Sample], timescale: u32, sample_duration: u64) -> u64 {
	if samples.is_empty() || sample_duration == 0 {
		return 0;
	}
	let total_bytes: usize = samples.iter().map(|s| s.data.len()).sum();
	let total_seconds = samples.len() as f64 * sample_duration as f64 / timescale as f64;
	(8.0 * total_bytes as f64 / total_seconds).round() as u64
}
