//! Pipeline definitions, their storage, and the registry that runs them.

pub mod parser;
pub mod registry;
pub mod repository;
pub mod types;

pub use parser::{parse_pipeline_config, validate_pipeline_config};
pub use registry::{Collaborators, PipelineRegistry};
pub use repository::{InMemoryRepository, JobRepository, PipelineRepository};
pub use types::{
    AlertChannel, AlertConfig, ChannelType, EndpointDescriptor, Frequency, Pipeline,
    PipelineConfig, PipelineConfigPatch, PipelineStatus, RetryConfig, ScheduleConfig,
};
