pub(crate) mod limits;
pub(crate) mod maintenance;
pub(crate) mod meta;
pub(crate) mod migrate;
pub(crate) mod shared;
pub(crate) mod subject;
pub(crate) mod sync;
