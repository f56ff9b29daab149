mod bridge;
mod connector;
mod error;
mod process;

pub use bridge::{BridgeProcess, DEFAULT_COMMAND_TIMEOUT};
pub use connector::BridgeConnector;
pub use error::{IpcError, Result};
