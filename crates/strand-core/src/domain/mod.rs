//! Domain model (IDs, rows, commands, errors).

pub mod command;
pub mod errors;
pub mod ids;
pub mod records;

pub use command::Command;
pub use errors::StorageError;
pub use ids::{CounterId, JobId, ListItemId, QueueEntryId, StateId};
pub use records::{
    CounterDelta, ExpirableKind, HashField, JobRecord, JobStateRecord, KeyedKind, ListItem,
    LockRecord, NewJob, QueueEntry, SetMember, StateChange,
};
