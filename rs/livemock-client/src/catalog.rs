//! Fetches and parses the catalog track (§4.7 / S5): subscribed first, before
//! any media track, since it names every variant and carries their init
//! segments.

use anyhow::Context;
use livemock::catalog::{Catalog, CATALOG_TRACK_NAME};
use livemock::control::{SubscribeAck, ACKS_TRACK};
use moq_lite::{BroadcastConsumer, Delivery};

pub async fn fetch(broadcast: &BroadcastConsumer) -> anyhow::Result<Catalog> {
	let mut track = broadcast
		.subscribe_track(CATALOG_TRACK_NAME, Delivery::default())
		.context("failed to subscribe to catalog track")?;

	let mut group = track
		.next_group()
		.await
		.context("catalog track closed before any group arrived")?
		.context("catalog track closed before any group arrived")?;

	let frame = group
		.read_frame()
		.await
		.context("failed to read catalog object")?
		.context("catalog group contained no object")?;

	let catalog: Catalog = serde_json::from_slice(&frame).context("malformed catalog JSON")?;
	Ok(catalog)
}

/// Fetches the one-shot `LargestLocation` snapshot the server serves
/// alongside the catalog. Supplementary, not load-bearing: a server that
/// predates this track, or a transient read failure, just means the
/// subscriber starts without knowing the live edge in advance.
pub async fn fetch_acks(broadcast: &BroadcastConsumer) -> anyhow::Result<Vec<SubscribeAck>> {
	let mut track = broadcast
		.subscribe_track(ACKS_TRACK, Delivery::default())
		.context("failed to subscribe to acks track")?;

	let mut group = track
		.next_group()
		.await
		.context("acks track closed before any group arrived")?
		.context("acks track closed before any group arrived")?;

	let frame = group
		.read_frame()
		.await
		.context("failed to read acks object")?
		.context("acks group contained no object")?;

	let acks: Vec<SubscribeAck> = serde_json::from_slice(&frame).context("malformed acks JSON")?;
	Ok(acks)
}

/// Picks a variant by substring match against track names, falling back to
/// the first match for `kind` (§4.7).
pub fn select<'a>(catalog: &'a Catalog, kind: &str, substring: Option<&str>) -> Option<&'a livemock::catalog::CatalogTrack> {
	let matches_kind = |t: &&livemock::catalog::CatalogTrack| match kind {
		"video" => t.mime_type.starts_with("video/"),
		"audio" => t.mime_type.starts_with("audio/"),
		_ => false,
	};

	if let Some(needle) = substring {
		if let Some(found) = catalog.tracks.iter().filter(matches_kind).find(|t| t.name.contains(needle)) {
			return Some(found);
		}
	}

	catalog.tracks.iter().find(matches_kind)
}

#[cfg(test)]
mod tests {
	use super::*;
	use livemock::catalog::CatalogTrack;

	fn track(name: &str, mime: &str) -> CatalogTrack {
		CatalogTrack {
			name: name.to_string(),
			namespace: vec!["live".into(), name.into()],
			packaging: "cmaf".into(),
			init_data: String::new(),
			codec: "avc3.640028".into(),
			mime_type: mime.to_string(),
			bitrate: 400_000,
			framerate: Some(25.0),
			width: Some(640),
			height: Some(360),
			sample_rate: None,
			channel_config: None,
			lang: "und".into(),
			render_group: 0,
			alt_group: 0,
		}
	}

	#[test]
	fn selects_by_substring() {
		let catalog = Catalog {
			version: 1,
			tracks: vec![
				track("400kbps", "video/mp4; codecs=\"avc3.640028\""),
				track("600kbps", "video/mp4; codecs=\"avc3.640028\""),
			],
		};
		let picked = select(&catalog, "video", Some("600")).unwrap();
		assert_eq!(picked.name, "600kbps");
	}

	#[test]
	fn falls_back_to_first_of_kind() {
		let catalog = Catalog {
			version: 1,
			tracks: vec![
				track("400kbps", "video/mp4; codecs=\"avc3.640028\""),
				track("audio_128k", "audio/mp4; codecs=\"mp4a.40.2\""),
			],
		};
		let picked = select(&catalog, "audio", None).unwrap();
		assert_eq!(picked.name, "audio_128k");
	}

	#[test]
	fn returns_none_when_no_track_of_kind() {
		let catalog = Catalog {
			version: 1,
			tracks: vec![track("400kbps", "video/mp4; codecs=\"avc3.640028\"")],
		};
		assert!(select(&catalog, "audio", None).is_none());
	}
}
