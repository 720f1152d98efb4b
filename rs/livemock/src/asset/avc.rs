//! AVC (H.264) sample preparation for the asset loader (§4.1).
//!
//! Samples as stored in the seed CMAF files use `avc1` framing: NAL units are
//! `length_size`-prefixed (no in-band parameter sets). This system rewrites
//! every IDR sample to `avc3` framing, prepending the track's SPS and PPS
//! (each 4-byte length-prefixed) immediately before the IDR NAL, so a
//! subscriber never needs the init segment's `avcC` to decode mid-stream.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_IDR: u8 = 5;
const NAL_NON_IDR: u8 = 1;
const NAL_SEI: u8 = 6;

/// Splits `length_size`-prefixed NAL units out of one AVC sample.
fn split_nals(data: &[u8], length_size: usize) -> Vec<&[u8]> {
	let mut nals = Vec::new();
	let mut pos = 0;

	while pos + length_size <= data.len() {
		let len = match length_size {
			4 => u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize,
			2 => u16::from_be_bytes(data[pos..pos + 2].try_into().unwrap()) as usize,
			_ => break,
		};
		pos += length_size;
		if pos + len > data.len() {
			break;
		}
		nals.push(&data[pos..pos + len]);
		pos += len;
	}

	nals
}

fn nal_unit_type(nal: &[u8]) -> Option<u8> {
	nal.first().map(|b| b & 0x1f)
}

/// Scans every sample for its SPS/PPS (there should be exactly one of each,
/// either inline per-sample or supplied by the caller from `avcC`), and
/// rewrites every IDR-bearing sample to carry them in-band.
///
/// Returns `(rewritten_samples, sps, pps)`.
pub fn prepare_avc_samples(
	file: &str,
	raw_samples: &[Bytes],
	length_size: usize,
	avcc_sps: &[Bytes],
	avcc_pps: &[Bytes],
) -> Result<(Vec<Bytes>, Bytes, Bytes)> {
	let mut sps_set: Vec<Bytes> = avcc_sps.to_vec();
	let mut pps_set: Vec<Bytes> = avcc_pps.to_vec();

	for sample in raw_samples {
		for nal in split_nals(sample, length_size) {
			match nal_unit_type(nal) {
				Some(NAL_SPS) => {
					let nal = Bytes::copy_from_slice(nal);
					if !sps_set.contains(&nal) {
						sps_set.push(nal);
					}
				}
				Some(NAL_PPS) => {
					let nal = Bytes::copy_from_slice(nal);
					if !pps_set.contains(&nal) {
						pps_set.push(nal);
					}
				}
				_ => {}
			}
		}
	}

	if sps_set.len() != 1 || pps_set.len() != 1 {
		return Err(Error::WrongParameterSetCount {
			file: file.to_string(),
			sps: sps_set.len(),
			pps: pps_set.len(),
		});
	}
	let sps = sps_set.remove(0);
	let pps = pps_set.remove(0);

	let rewritten = raw_samples
		.iter()
		.map(|sample| rewrite_sample(sample, length_size, &sps, &pps))
		.collect();

	Ok((rewritten, sps, pps))
}

/// Rewrites one sample, dropping everything but SPS/PPS/IDR/non-IDR/SEI NALs
/// and prepending SPS+PPS (4-byte length prefixed) before the first IDR.
fn rewrite_sample(sample: &[u8], length_size: usize, sps: &Bytes, pps: &Bytes) -> Bytes {
	let nals: Vec<&[u8]> = split_nals(sample, length_size)
		.into_iter()
		.filter(|nal| {
			matches!(
				nal_unit_type(nal),
				Some(NAL_SPS) | Some(NAL_PPS) | Some(NAL_IDR) | Some(NAL_NON_IDR) | Some(NAL_SEI)
			)
		})
		.collect();

	let has_idr = nals.iter().any(|nal| nal_unit_type(nal) == Some(NAL_IDR));

	let mut out = BytesMut::new();
	if has_idr {
		out.put_u32(sps.len() as u32);
		out.put_slice(sps);
		out.put_u32(pps.len() as u32);
		out.put_slice(pps);
	}

	for nal in nals {
		if matches!(nal_unit_type(nal), Some(NAL_SPS) | Some(NAL_PPS)) {
			// Already prepended once per IDR; the track carries one parameter set.
			continue;
		}
		out.put_u32(nal.len() as u32);
		out.put_slice(nal);
	}

	out.freeze()
}

/// Derives the `avc3.PPCCLL` codec string components from the SPS, per §4.1.
pub fn codec_components(sps_bytes: &[u8]) -> Result<(u8, u8, u8)> {
	let sps = h264_parser::Sps::parse(sps_bytes).map_err(|_| Error::UnsupportedCodec {
		file: "<sps>".to_string(),
		codec: "avc".to_string(),
	})?;

	let constraints = ((sps.constraint_set0_flag as u8) << 7)
		| ((sps.constraint_set1_flag as u8) << 6)
		| ((sps.constraint_set2_flag as u8) << 5)
		| ((sps.constraint_set3_flag as u8) << 4)
		| ((sps.constraint_set4_flag as u8) << 3)
		| ((sps.constraint_set5_flag as u8) << 2);

	Ok((sps.profile_idc, constraints, sps.level_idc))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn nal(nal_type: u8, payload: &[u8]) -> Vec<u8> {
		let mut out = vec![nal_type & 0x1f];
		out.extend_from_slice(payload);
		out
	}

	fn length_prefixed(nals: &[Vec<u8>]) -> Bytes {
		let mut out = BytesMut::new();
		for nal in nals {
			out.put_u32(nal.len() as u32);
			out.put_slice(nal);
		}
		out.freeze()
	}

	#[test]
	fn rewrite_prepends_parameter_sets_only_before_idr() {
		let sps = Bytes::from(nal(NAL_SPS, b"sps-body"));
		let pps = Bytes::from(nal(NAL_PPS, b"pps-body"));

		let idr_sample = length_prefixed(&[nal(NAL_IDR, b"idr-body")]);
		let p_sample = length_prefixed(&[nal(NAL_NON_IDR, b"p-body")]);

		let out_idr = rewrite_sample(&idr_sample, 4, &sps, &pps);
		let out_p = rewrite_sample(&p_sample, 4, &sps, &pps);

		assert!(out_idr.len() > idr_sample.len());
		assert_eq!(out_p.len(), p_sample.len());
	}

	#[test]
	fn prepare_requires_exactly_one_parameter_set_pair() {
		let sps1 = nal(NAL_SPS, b"sps-a");
		let sps2 = nal(NAL_SPS, b"sps-b");
		let idr = nal(NAL_IDR, b"idr-body");

		let samples = vec![length_prefixed(&[sps1, sps2, idr])];
		let err = prepare_avc_samples("test.mp4", &samples, 4, &[], &[]).unwrap_err();
		assert!(matches!(err, Error::WrongParameterSetCount { .. }));
	}
}
