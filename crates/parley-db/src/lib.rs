mod campaigns;
mod error;
mod ledger;
mod messages;
mod models;
mod queue;
mod repository;
mod schema;

pub use error::{DbError, Result};
pub use ledger::{CreditGrant, FailureDisposition};
pub use models::*;
pub use queue::EnqueueOptions;
pub use repository::{ParleyDb, now_millis};
