//! Flow and group table programming for the OF-DPA pipeline.

mod intent;
mod programmer;

pub use intent::{FlowIntent, FlowKey, GroupIntent, InstalledIntents};
pub use programmer::{FlowTableProgrammer, PolicyTrap};
