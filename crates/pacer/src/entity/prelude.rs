//! Common re-exports for convenient entity usage.

pub use super::activity::{
    ActiveModel as ActivityActiveModel, Column as ActivityColumn, Entity as ActivityEntity,
    Model as Activity,
};
pub use super::activity_kind::ActivityKind;
pub use super::activity_stream::{
    ActiveModel as ActivityStreamActiveModel, Column as ActivityStreamColumn,
    Entity as ActivityStreamEntity, Model as ActivityStreamModel, StreamSet,
};
pub use super::kv_state::{
    ActiveModel as KvStateActiveModel, Column as KvStateColumn, Entity as KvState,
    Model as KvStateModel,
};
pub use super::subject::{
    ActiveModel as SubjectActiveModel, Column as SubjectColumn, DatedValue,
    Entity as SubjectEntity, Model as Subject,
};
pub use super::sync_state::{SyncCategory, SyncEntry, SyncErrorInfo, SyncErrorKind, SyncStateMap};
