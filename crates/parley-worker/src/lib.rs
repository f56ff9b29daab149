mod config;
mod credentials;
mod delivery;
mod error;
mod events;
mod lifecycle;
mod machine;
mod qr;
mod queue;
mod registry;
mod service;

#[cfg(test)]
mod testing;

pub use config::{DeliveryConfig, SessionConfig};
pub use credentials::CredentialStore;
pub use delivery::{DeliveryWorker, JobOutcome, JobReport};
pub use error::{DeliveryError, Result, SessionError, WorkerError};
pub use events::WorkerEvent;
pub use lifecycle::{ConnectOutcome, SessionManager};
pub use machine::{Effect, HandleState, ReconnectPolicy, Transition, transition};
pub use qr::render_qr_data_url;
pub use queue::{DispatchQueue, RetryPolicy};
pub use registry::{HandleSnapshot, QrChallenge, SessionRegistry};
pub use service::{CampaignRequest, ParleyService, SendRequest};

pub use parley_db::{Campaign, CreditGrant, MessageRecord, ParleyDb, Tenant};
