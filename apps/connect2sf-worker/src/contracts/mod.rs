pub mod processing_error;
pub mod project_event;
pub mod validation;

pub use processing_error::{AckDecision, ProcessingError, Verdict};
pub use project_event::{
    PROJECT_CREATED, PROJECT_UPDATED, ProjectCreated, ProjectUpdated, failed_routing_key,
};
pub use validation::ValidationError;
