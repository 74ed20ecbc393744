// THEORY:
// This file is the main entry point for the `colony_vision` library crate.
// It defines the public API handed to runners and reporting tools.
//
// The primary goal is to export the `ProcessingOrchestrator` (parallel, from
// descriptors) and the `ColonyPipeline` (sequential, from decoded images)
// together with their configuration and report types. The analytical layers
// live in `core_modules`; they are public so a caller can run a single layer
// on its own, but most users only need what is re-exported here.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod logging;
pub mod parallel_pipeline;
pub mod pipeline;
pub mod source;

pub use config::AnalysisConfig;
pub use core_modules::colony::{Colony, GroupKey, Timepoint};
pub use core_modules::frame::{Image, ImageDescriptor};
pub use core_modules::growth::GrowthRecord;
pub use error::{ColonyError, ColonyResult};
pub use parallel_pipeline::{ImageStatus, LoggingProgress, NoopProgress, ProcessingOrchestrator, ProgressObserver};
pub use pipeline::{AnalysisReport, ColonyPipeline, ImageAnalysis, SkippedImage};
pub use source::{FileImageLoader, ImageLoader, MemoryImageLoader, discover_images};
