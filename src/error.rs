// THEORY:
// A single error type for the whole analyser. Errors fall into two families:
// 1.  **Per-image faults** (`NoPlateFound`, `AlignmentFailed`, `WorkerTaskFailure`)
//     are recoverable.
//     The orchestrator contains them at its boundary, records the image as
//     skipped and carries on with its siblings.
// 2.  **Run-level outcomes** are either fatal (bad configuration, unreadable
//     input, unwritable output) or the deliberate, graceful `EmptyColonySet`
//     exit when no image in the run produced a single colony.
//
// An undefined growth rate is not an error at all; it is a value
// (`GrowthRate::Undefined`) and never travels through this type.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ColonyError {
    /// No plausible plate region passed the size/contrast test.
    #[error("no plate found: {reason}")]
    NoPlateFound { reason: String },

    /// The image could not be registered against the run's reference frame.
    #[error("alignment failed: {reason}")]
    AlignmentFailed { reason: String },

    /// Unexpected failure while loading, segmenting or filtering one image.
    #[error("worker task failed: {0}")]
    WorkerTaskFailure(String),

    /// A timepoint arrived earlier than one already consumed for its plate.
    #[error("timepoint {} at {timestamp:?} arrived after a later timepoint for {group}", .source_path.display())]
    OutOfOrderTimepoint {
        group: String,
        source_path: PathBuf,
        timestamp: std::time::Duration,
    },

    /// Every image in the run yielded zero colonies.
    #[error("no colonies found in any image")]
    EmptyColonySet,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("cannot write output to {}: {message}", .path.display())]
    Output { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ColonyError {
    /// True for outcomes that end a run intentionally rather than by crashing.
    pub fn is_graceful(&self) -> bool {
        matches!(self, ColonyError::EmptyColonySet)
    }

    /// True for faults the orchestrator isolates to a single image.
    pub fn is_per_image(&self) -> bool {
        matches!(
            self,
            ColonyError::NoPlateFound { .. }
                | ColonyError::AlignmentFailed { .. }
                | ColonyError::WorkerTaskFailure(_)
                | ColonyError::ImageDecode(_)
        )
    }
}

pub type ColonyResult<T> = Result<T, ColonyError>;
