//! CoPilot client functionality modules.

mod command;
mod connection;
mod directory;
mod endpoint;
mod listener;
mod messages;
mod views;

#[cfg(test)]
mod mock;

pub use command::{
    ClientId, Command, Key, OpId, Operation, Value, COMMAND_SIZE, KEY_SIZE,
    VALUE_SIZE,
};
pub use directory::{Directory, StaticDirectory};
pub use endpoint::{ClientConfigCopilot, CopilotClient, CLIENT_ID_RANGE};
pub use listener::Response;
pub use messages::{
    write_msg, ClientMsg, PilotId, ReplicaId, ServerMsg, ViewId, WireMsg,
    GENERIC_SMR_BEACON, GENERIC_SMR_BEACON_REPLY, GET_VIEW, GET_VIEW_REPLY,
    PROPOSE, PROPOSE_AND_READ, PROPOSE_AND_READ_REPLY, PROPOSE_REPLY, READ,
    READ_REPLY, REGISTER_CLIENT_ID, REGISTER_CLIENT_ID_REPLY,
};
pub use views::{View, ViewTracker, NUM_PILOTS};
