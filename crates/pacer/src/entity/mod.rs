//! SeaORM entity definitions for the pacer database schema.

pub mod activity;
pub mod activity_kind;
pub mod activity_stream;
pub mod kv_state;
pub mod prelude;
pub mod subject;
pub mod sync_state;
