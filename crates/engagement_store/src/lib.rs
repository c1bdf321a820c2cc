//! Engagement store: the canonical per-participant message store.
//!
//! Messages are keyed by `(participant_uuid, origin_dataset, origin_flow,
//! received_at)`. The sync stage writes through [`EngagementStore::insert_or_touch`];
//! the coding stage mutates labels and datasets through compare-and-swap.

pub mod error;
pub mod message;
pub mod store;

pub use error::StoreError;
pub use message::{
    AppliedLabel, ConsistencyError, EngagementMessage, LabelOrigin, NewMessage, UpsertOutcome,
};
pub use store::{CasUpdate, EngagementStore};
