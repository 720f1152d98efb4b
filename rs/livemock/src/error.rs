/// Errors produced while loading assets, building the catalog, or synthesizing CMAF fragments.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
	#[error("asset directory contains no fragmented CMAF files")]
	EmptyAsset,

	#[error("{file}: not a fragmented MP4 (missing moov/mvex)")]
	NotFragmented { file: String },

	#[error("{file}: expected exactly one track, found {count}")]
	MultipleTracks { file: String, count: usize },

	#[error("{file}: sample duration is not constant (sample {index} has duration {found}, expected {expected})")]
	InconsistentSampleDuration {
		file: String,
		index: usize,
		found: u64,
		expected: u64,
	},

	#[error("{file}: GOP length is not constant (expected {expected}, found {found} at sync sample {index})")]
	InconsistentGop {
		file: String,
		index: usize,
		found: u64,
		expected: u64,
	},

	#[error("{file}: expected exactly one SPS and one PPS, found {sps} SPS and {pps} PPS")]
	WrongParameterSetCount { file: String, sps: usize, pps: usize },

	#[error("{file}: loop duration {found}ms does not match reference duration {expected}ms")]
	InconsistentLoopDuration { file: String, found: u64, expected: u64 },

	#[error("{file}: unsupported codec {codec}")]
	UnsupportedCodec { file: String, codec: String },

	#[error("mp4 box error: {0}")]
	Mp4(std::sync::Arc<mp4_atom::Error>),

	#[error("io error: {0}")]
	Io(#[from] std::sync::Arc<std::io::Error>),

	#[error("catalog serialization error: {0}")]
	Catalog(#[from] std::sync::Arc<serde_json::Error>),
}

impl From<mp4_atom::Error> for Error {
	fn from(err: mp4_atom::Error) -> Self {
		Error::Mp4(std::sync::Arc::new(err))
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Error::Io(std::sync::Arc::new(err))
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::Catalog(std::sync::Arc::new(err))
	}
}

pub type Result<T> = std::result::Result<T, Error>;
