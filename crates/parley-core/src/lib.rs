mod events;
mod jid;
mod job;
mod protocol;
mod status;
mod transport;

pub use events::*;
pub use jid::*;
pub use job::*;
pub use protocol::*;
pub use status::*;
pub use transport::*;
