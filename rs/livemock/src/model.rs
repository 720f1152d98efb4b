use bytes::Bytes;

/// The kind of media carried by a [`ContentTrack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
	Video,
	Audio,
	Subtitle,
}

/// Codec-specific initialization data, already normalized by the asset loader
/// (AVC samples rewritten to carry in-band parameter sets, AAC edit lists absorbed).
#[derive(Debug, Clone)]
pub enum CodecConfig {
	Avc {
		sps: Bytes,
		pps: Bytes,
		/// `avcC`/SPS-derived profile_idc, profile_compatibility, level_idc triple.
		profile: u8,
		constraints: u8,
		level: u8,
	},
	Aac {
		/// The raw `AudioSpecificConfig`, re-serialized into the synthesized `esds`.
		asc: Bytes,
		object_type: u8,
	},
}

impl CodecConfig {
	pub fn codec_string(&self) -> String {
		match self {
			CodecConfig::Avc {
				profile,
				constraints,
				level,
				..
			} => format!("avc3.{profile:02x}{constraints:02x}{level:02x}"),
			CodecConfig::Aac { object_type, .. } => format!("mp4a.40.{object_type}"),
		}
	}
}

/// A single decoded sample, already normalized by the asset loader.
///
/// For AVC tracks `data` carries the rewritten bitstream with SPS+PPS
/// prepended to every IDR. For AAC tracks `data` is the raw ADTS-stripped
/// frame. Subtitle tracks have no samples; they are synthesized on demand.
#[derive(Debug, Clone)]
pub struct Sample {
	pub data: Bytes,
	pub sync: bool,
}

/// One pre-encoded, pre-loaded variant of a track group.
///
/// Immutable after the asset loader builds it. Shared read-only across every
/// publisher and subscriber for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ContentTrack {
	/// The MoQ track name, e.g. `"400kbps"` or `"subs_wvtt_en"`.
	pub name: String,
	pub kind: TrackKind,

	/// Media timescale `T` (units per second).
	pub timescale: u32,

	/// Per-sample duration `D`, constant across all samples but possibly the last.
	pub sample_duration: u64,

	/// GOP length in samples. `None` for audio/subtitle tracks.
	pub gop: Option<u64>,

	/// Samples per CMAF chunk, `B` (the "sample batch").
	pub batch: u64,

	pub lang: String,
	pub codec: CodecConfig,

	/// Decoded samples for video/audio tracks. Empty for subtitle tracks,
	/// which are synthesized by [`crate::subtitle`] instead.
	pub samples: Vec<Sample>,

	/// `L_ms * T / 1000`, the loop duration expressed in track timescale units.
	pub loop_duration_units: u64,

	/// Estimated compressed bitrate of the raw samples, in bits per second
	/// (before the catalog builder adds CMAF fragmentation overhead).
	pub sample_bitrate: u64,

	pub width: Option<u16>,
	pub height: Option<u16>,
	pub sample_rate: Option<u32>,
	pub channel_count: Option<u16>,

	/// Variants that are mutually alternate (same content) share an `alt_group`.
	pub alt_group: u32,
	/// Tracks meant to be rendered together (e.g. one video + one audio) share a `render_group`.
	pub render_group: u32,
}

impl ContentTrack {
	/// Frame rate in samples/sec, `T / D`.
	pub fn frame_rate(&self) -> f64 {
		self.timescale as f64 / self.sample_duration as f64
	}

	/// Duration of a single CMAF object (one batch of `B` samples), in milliseconds.
	pub fn object_duration_ms(&self) -> f64 {
		1000.0 * (self.batch as f64) * (self.sample_duration as f64) / (self.timescale as f64)
	}

	/// `sampleOffsetMs`: 0 for video, one sample duration for audio (§4.3).
	pub fn sample_offset_ms(&self) -> f64 {
		match self.kind {
			TrackKind::Video => 0.0,
			TrackKind::Audio => 1000.0 * self.sample_duration as f64 / self.timescale as f64,
			TrackKind::Subtitle => 0.0,
		}
	}

	/// Number of samples in one loop of the asset timeline.
	pub fn loop_len_samples(&self) -> u64 {
		self.loop_duration_units / self.sample_duration
	}
}

/// A set of mutually-alternate variants, sorted ascending by bitrate.
#[derive(Debug, Clone)]
pub struct TrackGroup {
	pub alt_group: u32,
	pub variants: Vec<ContentTrack>,
}

/// The full loaded asset: every track group, immutable after startup.
#[derive(Debug, Clone)]
pub struct Asset {
	pub groups: Vec<TrackGroup>,
	/// `L_ms`, validated equal (in ms) across every track.
	pub loop_duration_ms: u64,
}

impl Asset {
	pub fn tracks(&self) -> impl Iterator<Item = &ContentTrack> {
		self.groups.iter().flat_map(|g| g.variants.iter())
	}

	pub fn track(&self, name: &str) -> Option<&ContentTrack> {
		self.tracks().find(|t| t.name == name)
	}
}
