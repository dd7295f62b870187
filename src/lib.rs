//! tablesmith - metadata-driven, multi-tenant table provisioning
//!
//! Users define tables and fields at runtime; tablesmith turns each
//! definition into a real relational table inside the owning project's
//! namespace, evolves it through versioned migrations and serves generic
//! validated CRUD over it.

pub mod access;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod crud;
pub mod errors;
pub mod identifier;
pub mod migration;
pub mod namespace;
pub mod observability;
pub mod platform;
pub mod registry;
pub mod storage;
pub mod validation;

pub use access::{CallerIdentity, IdentityProvider, Role, StaticIdentityProvider};
pub use catalog::{Confirmation, FieldDefinition, FieldOp, NewTable, TableDescriptor};
pub use config::PlatformConfig;
pub use crud::{ListQuery, ListResponse, Record};
pub use errors::{ErrorKind, FieldError, ReasonCode, TablesmithError, TablesmithResult};
pub use platform::{Platform, ProjectDeletion};
pub use registry::LogicalType;
