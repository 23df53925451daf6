//! Shared data types for the orchestration core (`spec.md` §3).

mod endpoint;
mod process_entry;
mod reservation;
mod server_descriptor;
mod subagent_definition;
mod task;

pub use endpoint::{Endpoint, Provider, ResourceHints};
pub use process_entry::{Owner, ProcessEntry, Status, Transport};
pub use reservation::ReservationKey;
pub use server_descriptor::{DockerDescriptor, GpuSelection, ServerDescriptor, ServerKind, SshAuth, SshDescriptor};
pub use subagent_definition::{Behavior, Metadata, ModelBinding, Personality, SubagentDefinition};
pub use task::{TaskDescriptor, Waiter};
