//! Edge Relay
//!
//! Real-time camera frame relay: a capture source feeds a bounded
//! drop-oldest queue, a processing worker filters and encodes each frame,
//! and the newest result is published to a latest-value cell that HTTP
//! viewers pull from.
//!
//! # Module Structure
//!
//! - `frame`: frame types, `FilterKind`, and the bounded `FrameQueue`
//! - `filter`: per-frame transforms (grayscale, edge detection, passthrough)
//! - `encode`: JPEG encoding of transformed frames
//! - `pipeline`: worker lifecycle, filter selection, and metrics
//! - `publish`: `LatestFrame`, the single-slot frame cell
//! - `api`: the pull-based HTTP server and embedded viewer page
//! - `client`: the viewer-side streaming loop
//! - `ingest`: capture sources and the capture driver
//! - `config`: file and environment configuration

pub mod api;
pub mod client;
pub mod config;
pub mod encode;
pub mod filter;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod publish;

pub use api::{ControlHandler, ServerConfig, ServerHandle, StreamingServer};
pub use client::{
    ClientConfig, ClientMetrics, ClientStreamLoop, FetchOutcome, FrameFetcher, FrameSink,
    HttpFrameFetcher, StreamControl,
};
pub use config::RelayConfig;
pub use encode::{FrameEncoder, JpegEncoder};
pub use filter::{CpuFilter, FrameTransform};
pub use frame::{Admission, FilterKind, FrameQueue, PixelFormat, ProcessedFrame, RawFrame};
pub use ingest::{CaptureDriver, FrameSource, SyntheticSource};
pub use pipeline::{Pipeline, PipelineConfig, PipelineMetrics};
pub use publish::LatestFrame;
