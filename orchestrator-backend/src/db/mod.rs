mod sqlite;
pub mod tables;
pub mod tenant;

pub use sqlite::Database;
pub(crate) use sqlite::{fmt_ts, get_enum, get_opt_enum, get_opt_ts, get_ts};
pub use tenant::{ScopedQuery, TenantScope};
