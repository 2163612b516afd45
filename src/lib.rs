pub mod cli;
pub mod error;
pub mod events;
pub mod ingest;
pub mod query;
pub mod reconcile;
pub mod recorder;
pub mod service;
pub mod state;
pub mod storage;

pub use error::{ErrorBody, StoreError};
pub use service::{FlowStateService, IngestOptions};
