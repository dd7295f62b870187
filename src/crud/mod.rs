//! Generic CRUD Engine
//!
//! Request-facing record operations for any catalog table:
//! - `list` with filter, sort and offset pagination
//! - `create`, `get`, `update` (partial), `delete`
//!
//! Only declared fields plus `_id`, `_created_at` and `_updated_at` can be
//! filtered or sorted on. Soft-deleted rows are invisible to every read.

mod engine;
pub mod filter;
pub mod query;
pub mod response;

pub use engine::{CrudEngine, CrudSettings, Record};
pub use filter::{FilterExpr, FilterOperator};
pub use query::{ListQuery, OrderBy, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use response::{DeleteResponse, ListResponse};
