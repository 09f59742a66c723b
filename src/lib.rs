pub mod artifact;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gate;
pub mod git;
pub mod manifest;
pub mod notify;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod recipe;
pub mod reports;
pub mod stages;
pub mod tools;
pub mod trigger;
pub mod validation;

pub use config::RunConfig;
pub use error::PipelineError;
pub use pipeline::{PipelineExecutor, PipelineRun, RunStatus, StageRegistry};
pub use recipe::Recipe;
