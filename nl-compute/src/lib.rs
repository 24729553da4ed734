mod error;
mod file_guard;
mod logging;
mod runtime;
mod wire;

pub use error::ComputeError;
pub use file_guard::{FileGuardError, ProjectFileGuard};
pub use logging::init as init_logging;
pub use runtime::{ComputeConfig, SharedState, build_compute_app};
pub use wire::{
    CapabilitiesResponse, ComputeNodeRecord, ComputeProjectRecord, ConsoleType,
    CreateProjectRequest, EmulatorType, ErrorResponse, NodeDefinition, ProjectVariable,
    UpdateProjectRequest, VersionResponse,
};
