//! Wall-clock CMAF synthesis and catalog/publish model for a looping MoQ
//! broadcast: loads static fragmented-MP4 seed assets once at startup, then
//! derives an infinite, wall-clock-aligned multi-bitrate stream from them on
//! demand.
//!
//! This crate is the pure, transport-agnostic core. `livemock-server` drives
//! it against real `moq-lite` sessions; `livemock-client` consumes the
//! catalog and CMAF fragments it produces.

pub mod asset;
pub mod catalog;
pub mod cmaf;
pub mod control;
pub mod error;
pub mod model;
pub mod planner;
pub mod source;
pub mod subtitle;
pub mod transport;

pub use error::{Error, Result};
pub use model::{Asset, CodecConfig, ContentTrack, Sample, TrackGroup, TrackKind};
pub use source::PublishSource;
