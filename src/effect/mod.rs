//! Effect invocation: dispatch, validation, and the durable `tasks/` journal.

pub mod error;
pub mod invoker;
pub mod record;
pub mod schema;

pub use error::{EffectError, EffectErrorKind};
pub use invoker::{EffectCall, EffectInvoker, TaskOutput};
pub use record::{
    args_digest, EffectFailureRecord, EffectInputRecord, EffectJournal, EffectResultRecord,
    EffectStatus,
};
pub use schema::validate_against_schema;
