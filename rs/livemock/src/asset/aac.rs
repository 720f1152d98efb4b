//! AAC sample preparation for the asset loader (§4.1): `AudioSpecificConfig`
//! parsing and edit-list absorption.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::model::Sample;

/// One `elst` entry, as found in an audio track's `edts/elst` box.
#[derive(Debug, Clone, Copy)]
pub struct EditListEntry {
	/// Offset, in the track's timescale units, of the first sample that
	/// should actually be played; everything before it is priming/padding.
	pub media_time: i64,
}

/// The `audioObjectType` field of `AudioSpecificConfig`, read from its first
/// five bits (the simple case; extended object types are not produced by any
/// encoder this system targets).
pub fn audio_object_type(asc: &[u8]) -> Result<u8> {
	let first = *asc.first().ok_or(Error::EmptyAsset)?;
	Ok(first >> 3)
}

/// Drops samples preceding the edit list's `media_time` and re-bases decode
/// times so the first playable sample starts at 0, per §4.1.
///
/// `raw` is `(original_decode_time, data)` pairs in decode order;
/// `sample_duration` is the constant per-sample duration `D`.
pub fn absorb_edit_list(raw: Vec<(u64, Bytes)>, edit_list: Option<EditListEntry>, sample_duration: u64) -> Vec<Sample> {
	debug_assert!(sample_duration > 0);

	let offset = match edit_list {
		Some(entry) if entry.media_time > 0 => entry.media_time as u64,
		_ => 0,
	};

	// The returned Vec's index is the re-based decode time (divided by `D`);
	// AAC frames have no inter-frame dependency, so every one is a sync sample.
	raw.into_iter()
		.filter(|(decode_time, _)| *decode_time >= offset)
		.map(|(_, data)| Sample { data, sync: true })
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn edit_list_drops_priming_samples() {
		let raw = vec![
			(0u64, Bytes::from_static(b"priming-a")),
			(1024, Bytes::from_static(b"priming-b")),
			(2048, Bytes::from_static(b"first-real")),
			(3072, Bytes::from_static(b"second-real")),
		];

		let out = absorb_edit_list(raw, Some(EditListEntry { media_time: 2048 }), 1024);
		assert_eq!(out.len(), 2);
		assert_eq!(out[0].data.as_ref(), b"first-real");
	}

	#[test]
	fn no_edit_list_keeps_every_sample() {
		let raw = vec![(0u64, Bytes::from_static(b"a")), (1024, Bytes::from_static(b"b"))];
		let out = absorb_edit_list(raw, None, 1024);
		assert_eq!(out.len(), 2);
	}

	#[test]
	fn object_type_reads_top_five_bits() {
		// AAC-LC is audioObjectType = 2 -> 0b00010_xxx
		assert_eq!(audio_object_type(&[0b00010_000, 0x08]).unwrap(), 2);
	}
}
