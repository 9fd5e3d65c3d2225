pub mod config;
pub mod context;
pub mod output;
pub mod pipeline;
pub mod queue;
pub mod shard;
pub mod sources;
mod stages;

pub use config::{ExecutionMode, PipelineConfig};
pub use context::{PipelineContext, ResultItem, RunStats, WorkItem};
pub use output::{
    format_detections, parse_result_file, result_path, ResultLine, ResultSink, ResultWriter,
};
pub use pipeline::{BatchRunner, RunReport};
pub use queue::{CompletionFlag, WorkQueue};
pub use shard::DetectorShards;
pub use sources::collect_images;
