//! Platform Scenario Tests
//!
//! End-to-end flows through the public `Platform` API:
//! - Create a table, write records, hit uniqueness conflicts, filter
//! - Add a required field to a table that already holds records
//! - Narrow a field with and without confirmation
//! - A failed migration leaves the table usable at its last good version
//! - Soft delete and value round-trips

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tablesmith::access::{CallerIdentity, Role, StaticIdentityProvider};
use tablesmith::catalog::{
    Confirmation, FieldDefinition, FieldOp, NewTable, SchemaVersion, TableStatus, VersionStatus,
};
use tablesmith::crud::{FilterExpr, ListQuery, OrderBy};
use tablesmith::errors::{ErrorKind, ReasonCode, TablesmithResult};
use tablesmith::migration::MigrationOutcome;
use tablesmith::observability::{MemoryAnalytics, NoopAnalytics, OperationKind};
use tablesmith::{LogicalType, Platform, PlatformConfig};

// =============================================================================
// Helper Functions
// =============================================================================

const OWNER: &str = "owner-token";
const PROJECT: &str = "acme";
const WAIT: Duration = Duration::from_secs(10);

fn identity() -> StaticIdentityProvider {
    StaticIdentityProvider::new().with_token(
        OWNER,
        CallerIdentity::new("alice", Role::Owner).with_project(PROJECT),
    )
}

async fn open_platform() -> Platform {
    Platform::open(PlatformConfig::in_memory(), Arc::new(identity()), Arc::new(NoopAnalytics))
        .await
        .unwrap()
}

fn clients() -> NewTable {
    NewTable::new(
        "clients",
        vec![
            FieldDefinition::new("name", LogicalType::short_text()).required(),
            FieldDefinition::new("email", LogicalType::Email).required().unique(),
        ],
    )
}

async fn alter_and_wait(
    platform: &Platform,
    table: &str,
    ops: Vec<FieldOp>,
    confirmation: Confirmation,
) -> TablesmithResult<SchemaVersion> {
    let entry = platform
        .alter_table(OWNER, PROJECT, table, ops, confirmation)
        .await?;
    platform
        .wait_for_version(OWNER, PROJECT, &entry.table_id, entry.version, WAIT)
        .await?;
    Ok(entry)
}

fn version_of(platform: &Platform, table: &str, version: u64) -> SchemaVersion {
    platform
        .schema_versions(OWNER, PROJECT, table)
        .unwrap()
        .into_iter()
        .find(|v| v.version == version)
        .unwrap()
}

// =============================================================================
// Record Flow
// =============================================================================

/// Create, conflict on the unique email, then find the record by filter.
#[tokio::test]
async fn test_clients_scenario() {
    let platform = open_platform().await;
    platform.create_table(OWNER, PROJECT, clients()).await.unwrap();

    let jean = platform
        .create_record(OWNER, PROJECT, "clients", json!({"name": "Jean", "email": "jean@x.com"}))
        .await
        .unwrap();
    assert_eq!(jean["name"], "Jean");
    assert!(jean["_id"].is_string());

    let err = platform
        .create_record(OWNER, PROJECT, "clients", json!({"name": "Other", "email": "jean@x.com"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.field_error("email").unwrap().reason, ReasonCode::NotUnique);

    let page = platform
        .list_records(
            OWNER,
            PROJECT,
            "clients",
            ListQuery::new().filter(FilterExpr::eq("email", json!("jean@x.com"))),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.data.len(), 1);
    assert_eq!(page.data[0]["_id"], jean["_id"]);

    let metrics = platform.metrics();
    assert_eq!(metrics.records_created, 1);
    assert_eq!(metrics.conflicts, 1);
}

/// Every collected field error is reported, not only the first.
#[tokio::test]
async fn test_invalid_record_reports_every_field() {
    let platform = open_platform().await;
    platform.create_table(OWNER, PROJECT, clients()).await.unwrap();

    let err = platform
        .create_record(OWNER, PROJECT, "clients", json!({"email": "not-an-email"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(err.field_error("name").unwrap().reason, ReasonCode::Required);
    assert_eq!(err.field_error("email").unwrap().reason, ReasonCode::InvalidFormat);
    assert_eq!(platform.metrics().validation_rejections, 1);
}

/// Accepted values come back exactly as they were written.
#[tokio::test]
async fn test_values_round_trip_through_storage() {
    let platform = open_platform().await;
    platform
        .create_table(
            OWNER,
            PROJECT,
            NewTable::new(
                "everything",
                vec![
                    FieldDefinition::new("title", LogicalType::short_text()),
                    FieldDefinition::new("notes", LogicalType::long_text()),
                    FieldDefinition::new("count", LogicalType::integer()),
                    FieldDefinition::new("price", LogicalType::decimal()),
                    FieldDefinition::new("active", LogicalType::Boolean),
                    FieldDefinition::new("due", LogicalType::Date),
                    FieldDefinition::new("seen_at", LogicalType::Datetime),
                    FieldDefinition::new("contact", LogicalType::Email),
                    FieldDefinition::new("stage", LogicalType::choice(["lead", "won"])),
                    FieldDefinition::new("extra", LogicalType::Json),
                ],
            ),
        )
        .await
        .unwrap();

    let input = json!({
        "title": "Déjà vu",
        "notes": "line one\nline two",
        "count": -42,
        "price": 12.5,
        "active": true,
        "due": "2024-02-29",
        "seen_at": "2024-01-01T08:00:00.000Z",
        "contact": "ops@example.org",
        "stage": "won",
        "extra": {"tags": ["a", "b"], "level": 3}
    });
    let created = platform
        .create_record(OWNER, PROJECT, "everything", input.clone())
        .await
        .unwrap();
    let id = created["_id"].as_str().unwrap().to_string();
    let fetched = platform.get_record(OWNER, PROJECT, "everything", &id).await.unwrap();

    for (field, value) in input.as_object().unwrap() {
        assert_eq!(&fetched[field.as_str()], value, "field {}", field);
    }

    let updated = platform
        .update_record(OWNER, PROJECT, "everything", &id, fetched.clone().into())
        .await
        .unwrap();
    for field in input.as_object().unwrap().keys() {
        assert_eq!(updated[field.as_str()], fetched[field.as_str()]);
    }
}

/// Pages follow the requested order and report the full match count.
#[tokio::test]
async fn test_list_pagination_and_order() {
    let platform = open_platform().await;
    platform.create_table(OWNER, PROJECT, clients()).await.unwrap();
    for name in ["carol", "alice", "bob", "dave"] {
        platform
            .create_record(
                OWNER,
                PROJECT,
                "clients",
                json!({"name": name, "email": format!("{}@x.com", name)}),
            )
            .await
            .unwrap();
    }

    let page = platform
        .list_records(
            OWNER,
            PROJECT,
            "clients",
            ListQuery::new()
                .order_by(OrderBy::asc("name"))
                .with_limit(2)
                .with_offset(1),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 4);
    assert_eq!(page.count, 2);
    let names: Vec<_> = page.data.iter().map(|r| r["name"].clone()).collect();
    assert_eq!(names, vec![json!("bob"), json!("carol")]);

    let err = platform
        .list_records(OWNER, PROJECT, "clients", ListQuery::new().with_limit(5_000))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(err.field_error("limit").unwrap().reason, ReasonCode::PageSizeExceeded);

    let err = platform
        .list_records(OWNER, PROJECT, "clients", ListQuery::new().order_by(OrderBy::desc("age")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownField);
}

/// Query-string filters are read by field type: numeric-looking text on a
/// text field stays text, and range limits do not apply to operands.
#[tokio::test]
async fn test_query_string_filters_follow_field_types() {
    let platform = open_platform().await;
    platform
        .create_table(
            OWNER,
            PROJECT,
            NewTable::new(
                "addresses",
                vec![
                    FieldDefinition::new("zip", LogicalType::ShortText { max_length: 5 }),
                    FieldDefinition::new(
                        "floor",
                        LogicalType::Integer {
                            min: Some(0),
                            max: Some(100),
                        },
                    ),
                ],
            ),
        )
        .await
        .unwrap();
    for (zip, floor) in [("75001", 3), ("69002", 12)] {
        platform
            .create_record(OWNER, PROJECT, "addresses", json!({"zip": zip, "floor": floor}))
            .await
            .unwrap();
    }

    let page = platform
        .list_records(OWNER, PROJECT, "addresses", ListQuery::from_pairs([("zip", "75001")]).unwrap())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.data[0]["zip"], json!("75001"));

    let page = platform
        .list_records(
            OWNER,
            PROJECT,
            "addresses",
            ListQuery::from_pairs([("floor", "gte.10"), ("zip", "in.(69002,13001)")]).unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.data[0]["floor"], json!(12));

    let page = platform
        .list_records(OWNER, PROJECT, "addresses", ListQuery::from_pairs([("floor", "gt.150")]).unwrap())
        .await
        .unwrap();
    assert_eq!(page.total, 0);

    let err = platform
        .list_records(OWNER, PROJECT, "addresses", ListQuery::from_pairs([("floor", "eq.high")]).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.field_error("floor").unwrap().reason, ReasonCode::TypeMismatch);

    let err = platform
        .list_records(
            OWNER,
            PROJECT,
            "addresses",
            ListQuery::from_pairs([("offset", "9223372036854775808")]).unwrap(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(err.field_error("offset").unwrap().reason, ReasonCode::OutOfRange);
}

// =============================================================================
// Schema Evolution
// =============================================================================

/// A required field added later binds new records only.
#[tokio::test]
async fn test_required_field_added_to_populated_table() {
    let platform = open_platform().await;
    platform.create_table(OWNER, PROJECT, clients()).await.unwrap();
    let jean = platform
        .create_record(OWNER, PROJECT, "clients", json!({"name": "Jean", "email": "jean@x.com"}))
        .await
        .unwrap();
    let id = jean["_id"].as_str().unwrap().to_string();

    alter_and_wait(
        &platform,
        "clients",
        vec![FieldOp::Add {
            field: FieldDefinition::new("phone", LogicalType::short_text()).required(),
        }],
        Confirmation::none(),
    )
    .await
    .unwrap();

    let err = platform
        .create_record(OWNER, PROJECT, "clients", json!({"name": "Ana", "email": "ana@x.com"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(err.field_error("phone").unwrap().reason, ReasonCode::Required);

    let existing = platform.get_record(OWNER, PROJECT, "clients", &id).await.unwrap();
    assert!(existing["phone"].is_null());

    let renamed = platform
        .update_record(OWNER, PROJECT, "clients", &id, json!({"name": "Jean B."}))
        .await
        .unwrap();
    assert_eq!(renamed["name"], "Jean B.");
    assert!(renamed["phone"].is_null());

    let err = platform
        .update_record(OWNER, PROJECT, "clients", &id, json!({"phone": null}))
        .await
        .unwrap_err();
    assert_eq!(err.field_error("phone").unwrap().reason, ReasonCode::NullNotAllowed);

    platform
        .create_record(
            OWNER,
            PROJECT,
            "clients",
            json!({"name": "Ana", "email": "ana@x.com", "phone": "555-0100"}),
        )
        .await
        .unwrap();
}

/// Narrowing needs confirmation; confirmed, long values are truncated and
/// counted in the version log.
#[tokio::test]
async fn test_narrowing_with_and_without_confirmation() {
    let platform = open_platform().await;
    platform
        .create_table(
            OWNER,
            PROJECT,
            NewTable::new("contacts", vec![FieldDefinition::new("email", LogicalType::long_text())]),
        )
        .await
        .unwrap();
    let long = platform
        .create_record(OWNER, PROJECT, "contacts", json!({"email": "averyveryverylong@example.com"}))
        .await
        .unwrap();
    platform
        .create_record(OWNER, PROJECT, "contacts", json!({"email": "a@b.co"}))
        .await
        .unwrap();

    let narrow = vec![FieldOp::ChangeType {
        name: "email".into(),
        to: LogicalType::ShortText { max_length: 10 },
    }];
    let err = platform
        .alter_table(OWNER, PROJECT, "contacts", narrow.clone(), Confirmation::none())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DestructiveChangeRejected);
    assert_eq!(platform.get_table(OWNER, PROJECT, "contacts").unwrap().current_version, 1);

    let entry = alter_and_wait(&platform, "contacts", narrow, Confirmation::confirmed())
        .await
        .unwrap();
    let logged = version_of(&platform, "contacts", entry.version);
    assert_eq!(logged.status, VersionStatus::Applied);
    assert_eq!(logged.lossy_rows, 1);

    let id = long["_id"].as_str().unwrap();
    let truncated = platform.get_record(OWNER, PROJECT, "contacts", id).await.unwrap();
    assert_eq!(truncated["email"], "averyveryv");

    let table = platform.get_table(OWNER, PROJECT, "contacts").unwrap();
    assert_eq!(table.fields[0].type_name, "short_text");
    assert_eq!(table.applied_version, entry.version);
}

/// A rolled-back version is reported and the table keeps serving at its
/// last applied definition.
#[tokio::test]
async fn test_failed_migration_freezes_table_at_last_good_version() {
    let platform = open_platform().await;
    platform
        .create_table(
            OWNER,
            PROJECT,
            NewTable::new("notes", vec![FieldDefinition::new("body", LogicalType::long_text())]),
        )
        .await
        .unwrap();
    platform
        .create_record(OWNER, PROJECT, "notes", json!({"body": "this does not fit"}))
        .await
        .unwrap();

    let mut reports = platform.subscribe_migrations();
    let err = alter_and_wait(
        &platform,
        "notes",
        vec![FieldOp::ChangeType {
            name: "body".into(),
            to: LogicalType::ShortText { max_length: 4 },
        }],
        Confirmation::reject_overflow(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MigrationFailed);
    assert_eq!(err.table(), Some("notes"));

    let report = reports.recv().await.unwrap();
    assert_eq!(report.version, 2);
    assert!(matches!(report.outcome, MigrationOutcome::Failed { .. }));

    let table = platform.get_table(OWNER, PROJECT, "notes").unwrap();
    assert_eq!(table.status, TableStatus::Ready);
    assert_eq!(table.applied_version, 1);
    assert_eq!(table.fields[0].type_name, "long_text");
    assert_eq!(version_of(&platform, "notes", 2).status, VersionStatus::Failed);
    assert_eq!(platform.metrics().migrations_failed, 1);

    platform
        .create_record(OWNER, PROJECT, "notes", json!({"body": "still writable"}))
        .await
        .unwrap();
}

/// Renames keep the data and the physical table.
#[tokio::test]
async fn test_rename_field_keeps_values() {
    let platform = open_platform().await;
    platform.create_table(OWNER, PROJECT, clients()).await.unwrap();
    let jean = platform
        .create_record(OWNER, PROJECT, "clients", json!({"name": "Jean", "email": "jean@x.com"}))
        .await
        .unwrap();

    alter_and_wait(
        &platform,
        "clients",
        vec![FieldOp::Rename {
            from: "name".into(),
            to: "full_name".into(),
        }],
        Confirmation::none(),
    )
    .await
    .unwrap();

    let fetched = platform
        .get_record(OWNER, PROJECT, "clients", jean["_id"].as_str().unwrap())
        .await
        .unwrap();
    assert_eq!(fetched["full_name"], "Jean");
    assert!(fetched.get("name").is_none());
}

// =============================================================================
// Soft Delete & Analytics
// =============================================================================

/// Soft-deleted rows disappear from reads and release unique values.
#[tokio::test]
async fn test_soft_delete_through_platform() {
    let analytics = MemoryAnalytics::new();
    let platform = Platform::open(
        PlatformConfig::in_memory(),
        Arc::new(identity()),
        Arc::new(analytics.clone()),
    )
    .await
    .unwrap();
    platform.create_table(OWNER, PROJECT, clients()).await.unwrap();
    let table = platform.set_soft_delete(OWNER, PROJECT, "clients", true).await.unwrap();
    assert!(table.options.soft_delete);

    let jean = platform
        .create_record(OWNER, PROJECT, "clients", json!({"name": "Jean", "email": "jean@x.com"}))
        .await
        .unwrap();
    let id = jean["_id"].as_str().unwrap().to_string();
    let deleted = platform.delete_record(OWNER, PROJECT, "clients", &id).await.unwrap();
    assert!(deleted.soft);

    let err = platform.get_record(OWNER, PROJECT, "clients", &id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let page = platform
        .list_records(OWNER, PROJECT, "clients", ListQuery::new())
        .await
        .unwrap();
    assert_eq!(page.total, 0);

    platform
        .create_record(OWNER, PROJECT, "clients", json!({"name": "Jean", "email": "jean@x.com"}))
        .await
        .unwrap();

    let operations: Vec<_> = analytics.events().iter().map(|e| e.operation).collect();
    assert_eq!(
        operations,
        vec![
            OperationKind::TableCreated,
            OperationKind::TableAltered,
            OperationKind::RecordCreated,
            OperationKind::RecordDeleted,
            OperationKind::RecordCreated,
        ]
    );
}
