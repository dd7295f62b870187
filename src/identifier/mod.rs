//! Identifier Mapper
//!
//! Turns user-chosen names into physical identifiers that are safe to place
//! in DDL/DML as structural tokens.
//!
//! # Invariants
//!
//! - Deterministic: the same inputs always yield the same identifier
//! - Output alphabet is `[a-z0-9_]`, at most 63 bytes
//! - Every output starts with a kind prefix, so it never equals a reserved
//!   word or a system column
//! - A SHA-256 suffix over the original name keeps names that differ only
//!   outside the alphabet, or only past the truncation point, distinct
//! - `PhysicalIdent` can only be built here; no user string reaches SQL
//!   except as a bound parameter

use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Longest physical identifier produced
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Longest accepted logical name, in characters
pub const MAX_LOGICAL_NAME_LENGTH: usize = 64;

/// Hex digits of the hash suffix
const HASH_SUFFIX_LEN: usize = 16;

/// Separator between a namespace and a table slug
const NAMESPACE_SEPARATOR: &str = "__";

/// Names the catalog refuses for user fields and tables
pub const RESERVED_NAMES: &[&str] = &[
    "_id",
    "_created_at",
    "_updated_at",
    "_deleted_at",
    "id",
    "rowid",
    "oid",
    "_rowid_",
];

/// Identifier errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("name must not be empty")]
    Empty,

    #[error("name '{0}' exceeds {max} characters", max = MAX_LOGICAL_NAME_LENGTH)]
    TooLong(String),

    #[error("name contains a control character at position {0}")]
    ControlCharacter(usize),

    #[error("name '{0}' is reserved")]
    Reserved(String),

    #[error("'{0}' is not a safe physical identifier")]
    Unsafe(String),
}

/// Kind of physical object an identifier names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentKind {
    Namespace,
    Table,
    Column,
    UniqueIndex,
}

impl IdentKind {
    fn prefix(&self) -> &'static str {
        match self {
            IdentKind::Namespace => "ns_",
            IdentKind::Table => "t_",
            IdentKind::Column => "c_",
            IdentKind::UniqueIndex => "ux_",
        }
    }
}

/// A physical identifier. Only the mapper and the storage layer's fixed
/// system names construct one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalIdent(String);

impl PhysicalIdent {
    /// Re-checks a stored identifier (loaded from catalog rows) before it
    /// is trusted as a structural token.
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        if is_safe(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(IdentifierError::Unsafe(raw.to_string()))
        }
    }

    /// Fixed system identifiers (`_id`, `_created_at`, ...) and metadata
    /// table names. Panics on a non-literal misuse caught by tests.
    pub(crate) fn system(name: &'static str) -> Self {
        debug_assert!(is_safe(name), "system identifier '{}' is unsafe", name);
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Renders the identifier quoted for SQL
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for PhysicalIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for PhysicalIdent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PhysicalIdent {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PhysicalIdent::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn is_safe(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_IDENTIFIER_LENGTH
        && raw
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        && !raw.as_bytes()[0].is_ascii_digit()
}

/// Checks a user-chosen logical name for tables and fields
pub fn check_logical_name(name: &str) -> Result<(), IdentifierError> {
    if name.trim().is_empty() {
        return Err(IdentifierError::Empty);
    }
    if name.chars().count() > MAX_LOGICAL_NAME_LENGTH {
        return Err(IdentifierError::TooLong(name.to_string()));
    }
    if let Some(pos) = name.chars().position(char::is_control) {
        return Err(IdentifierError::ControlCharacter(pos));
    }
    if name.starts_with('_') || RESERVED_NAMES.contains(&name.to_lowercase().as_str()) {
        return Err(IdentifierError::Reserved(name.to_string()));
    }
    Ok(())
}

/// Pure, deterministic name-to-identifier mapping
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifierMapper;

impl IdentifierMapper {
    pub fn new() -> Self {
        Self
    }

    /// Namespace identifier for a project
    pub fn namespace(&self, project_id: &str) -> Result<PhysicalIdent, IdentifierError> {
        if project_id.trim().is_empty() {
            return Err(IdentifierError::Empty);
        }
        // Namespaces are pure hashes so project ids never leak into the
        // physical schema.
        let digest = hex_digest(&["namespace", project_id]);
        Ok(PhysicalIdent(format!(
            "{}{}",
            IdentKind::Namespace.prefix(),
            &digest[..HASH_SUFFIX_LEN]
        )))
    }

    /// Physical table identifier for `logical_name` inside `namespace`
    pub fn table(
        &self,
        namespace: &PhysicalIdent,
        logical_name: &str,
    ) -> Result<PhysicalIdent, IdentifierError> {
        check_logical_name(logical_name)?;
        let prefix = format!("{}{}", namespace.as_str(), NAMESPACE_SEPARATOR);
        Ok(self.build(
            IdentKind::Table,
            &prefix,
            logical_name,
            &["table", namespace.as_str(), logical_name],
        ))
    }

    /// Physical column identifier for a field name
    pub fn column(&self, field_name: &str) -> Result<PhysicalIdent, IdentifierError> {
        check_logical_name(field_name)?;
        Ok(self.build(IdentKind::Column, "", field_name, &["column", field_name]))
    }

    /// Unique index identifier for a column of a table
    pub fn unique_index(&self, table: &PhysicalIdent, column: &PhysicalIdent) -> PhysicalIdent {
        self.build(
            IdentKind::UniqueIndex,
            "",
            column.as_str(),
            &["unique", table.as_str(), column.as_str()],
        )
    }

    /// Scratch table used while rebuilding `table`
    pub fn rebuild_scratch(&self, table: &PhysicalIdent) -> PhysicalIdent {
        let digest = hex_digest(&["rebuild", table.as_str()]);
        PhysicalIdent(format!("{}rebuild_{}", IdentKind::Table.prefix(), &digest[..HASH_SUFFIX_LEN]))
    }

    /// Prefix shared by every table of `namespace`
    pub fn table_prefix(&self, namespace: &PhysicalIdent) -> String {
        format!(
            "{}{}{}",
            IdentKind::Table.prefix(),
            namespace.as_str(),
            NAMESPACE_SEPARATOR
        )
    }

    fn build(&self, kind: IdentKind, scope: &str, name: &str, hash_parts: &[&str]) -> PhysicalIdent {
        let digest = hex_digest(hash_parts);
        let suffix = &digest[..HASH_SUFFIX_LEN];
        let fixed = kind.prefix().len() + scope.len() + 1 + HASH_SUFFIX_LEN;
        let budget = MAX_IDENTIFIER_LENGTH.saturating_sub(fixed);
        let slug = slugify(name, budget);
        let ident = if slug.is_empty() {
            format!("{}{}{}", kind.prefix(), scope, suffix)
        } else {
            format!("{}{}{}_{}", kind.prefix(), scope, slug, suffix)
        };
        PhysicalIdent(ident)
    }
}

/// Lowercases, replaces characters outside `[a-z0-9]` with `_`, collapses
/// runs and trims to `budget` bytes.
fn slugify(name: &str, budget: usize) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            slug.push(c);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let mut slug = slug.trim_matches('_').to_string();
    slug.truncate(budget);
    slug.trim_end_matches('_').to_string()
}

fn hex_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        // Length-prefix each part so ("ab","c") and ("a","bc") differ.
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ns() -> PhysicalIdent {
        IdentifierMapper::new().namespace("project-1").unwrap()
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let mapper = IdentifierMapper::new();
        let a = mapper.table(&ns(), "Clients").unwrap();
        let b = mapper.table(&ns(), "Clients").unwrap();
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("t_ns_"));
    }

    #[test]
    fn test_names_differing_outside_alphabet_stay_distinct() {
        let mapper = IdentifierMapper::new();
        let names = [
            "client email",
            "client-email",
            "client_email",
            "Client Email",
            "client.email",
            "client email!",
            "clïent email",
        ];
        let idents: HashSet<_> = names.iter().map(|n| mapper.column(n).unwrap()).collect();
        assert_eq!(idents.len(), names.len());
    }

    #[test]
    fn test_truncated_names_stay_distinct() {
        let mapper = IdentifierMapper::new();
        let base = "a".repeat(60);
        let a = mapper.table(&ns(), &format!("{}x", base)).unwrap();
        let b = mapper.table(&ns(), &format!("{}y", base)).unwrap();
        assert_ne!(a, b);
        assert!(a.as_str().len() <= MAX_IDENTIFIER_LENGTH);
        assert!(b.as_str().len() <= MAX_IDENTIFIER_LENGTH);
    }

    #[test]
    fn test_outputs_are_safe_and_never_reserved() {
        let mapper = IdentifierMapper::new();
        for name in ["select", "table", "drop table x;--", "\"quoted\"", "名前", "rowid value"] {
            let ident = mapper.column(name).unwrap();
            assert!(PhysicalIdent::parse(ident.as_str()).is_ok(), "{}", ident);
            assert!(!RESERVED_NAMES.contains(&ident.as_str()));
            assert!(!ident.as_str().contains('"'));
        }
    }

    #[test]
    fn test_invalid_logical_names_rejected() {
        assert_eq!(check_logical_name(""), Err(IdentifierError::Empty));
        assert_eq!(check_logical_name("   "), Err(IdentifierError::Empty));
        assert!(matches!(
            check_logical_name("bad\nname"),
            Err(IdentifierError::ControlCharacter(3))
        ));
        assert!(matches!(check_logical_name("_id"), Err(IdentifierError::Reserved(_))));
        assert!(matches!(check_logical_name("ID"), Err(IdentifierError::Reserved(_))));
        assert!(matches!(
            check_logical_name(&"x".repeat(65)),
            Err(IdentifierError::TooLong(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unsafe_identifiers() {
        assert!(PhysicalIdent::parse("t_ok_123").is_ok());
        assert!(PhysicalIdent::parse("Upper").is_err());
        assert!(PhysicalIdent::parse("x\"; drop").is_err());
        assert!(PhysicalIdent::parse("1abc").is_err());
        assert!(PhysicalIdent::parse("").is_err());
    }

    #[test]
    fn test_namespaces_differ_per_project() {
        let mapper = IdentifierMapper::new();
        let a = mapper.namespace("p1").unwrap();
        let b = mapper.namespace("p2").unwrap();
        assert_ne!(a, b);
        let t = mapper.table(&a, "clients").unwrap();
        assert!(t.as_str().starts_with(&mapper.table_prefix(&a)));
        assert!(!t.as_str().starts_with(&mapper.table_prefix(&b)));
    }
}
