mod context;
mod participant;
mod registry;
mod shutdown;

pub use context::CoreContext;
pub use participant::{ParticipantOutcome, SharedResource, ShutdownParticipant};
pub use registry::{RegistryKey, SharedResourceRegistry};
pub use shutdown::{ShutdownCoordinator, ShutdownPhase};
