mod compute_link;
mod controller;
mod error;
mod node;
mod placement;
mod ports;
mod project;
mod server;
mod settings;

pub use compute_link::{Compute, ComputeLink, ComputeRecord, ComputeStatus, RegisterComputeRequest};
pub use controller::Controller;
pub use error::{ControllerError, Result};
pub use node::{Node, NodeRecord, NodeSpec, NodeUpdate, console_port_class};
pub use placement::PlacementStrategy;
pub use ports::{PortAllocator, PortClass, PortRange, PortReservation};
pub use project::{PendingNode, Project, ProjectRecord, ProjectStatus};
pub use server::{ControllerState, build_controller_app};
pub use settings::{SETTINGS_PATH_ENV, ServerProtocol, ServerSettings};
