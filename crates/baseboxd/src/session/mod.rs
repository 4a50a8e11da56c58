//! Datapath sessions: connection state, the attach/detach state machine and
//! the OpenFlow listener.

mod connection;
mod server;
mod switch;

pub use connection::{ConnectionState, SwitchConnection};
pub use server::{run_connection, serve};
pub use switch::{SessionPhase, SwitchSession};
