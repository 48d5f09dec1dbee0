mod common;

use common::{Harness, SpyAdapter};
use dbroute_core::alerts::AlertKind;
use dbroute_core::{params, Backend, QueryOptions, SqlValue, VerificationStatus};

fn healthy() -> Harness {
    Harness::new(
        SpyAdapter::healthy(Backend::Primary),
        SpyAdapter::healthy(Backend::Legacy),
        &[],
    )
}

const INSERT_USER: &str = "INSERT INTO users (name, age) VALUES (@Name, @Age)";

#[tokio::test]
async fn insert_matching_row_verifies_ok() {
    let h = healthy();
    h.primary
        .store_row(params! { "id" => 7, "name" => "Ada", "age" => "36" });

    let id = h
        .repo
        .insert_and_get_id(
            INSERT_USER,
            &params! { "Name" => "Ada", "Age" => 36 },
            "id",
            QueryOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(id, Some(SqlValue::Int(7)));

    let executed = h.primary.executed();
    assert_eq!(executed[1], "SELECT * FROM users WHERE id = @VerifyValue");

    let record = &h.audit.records()[0];
    let verification = record.verification.as_ref().expect("verified");
    assert_eq!(verification.status, VerificationStatus::Ok);
    assert_eq!(verification.details["reason"], "row_verified");
    assert!(h.alerts.alerts().is_empty());
}

#[tokio::test]
async fn insert_with_diverging_field_is_a_mismatch() {
    let h = healthy();
    // Changed out of band between the write and the re-read.
    h.primary
        .store_row(params! { "id" => 7, "name" => "Eve", "age" => 36 });

    let id = h
        .repo
        .insert_and_get_id(
            INSERT_USER,
            &params! { "Name" => "Ada", "Age" => 36 },
            "id",
            QueryOptions::new(),
        )
        .await
        .expect("mismatch does not fail the write");
    assert_eq!(id, Some(SqlValue::Int(7)));

    let verification = h.audit.records()[0].verification.clone().unwrap();
    assert_eq!(verification.status, VerificationStatus::Mismatch);
    assert_eq!(verification.details["reason"], "value_mismatch");
    assert_eq!(verification.details["fields"], serde_json::json!(["name"]));

    let alerts = h.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::DbWriteVerificationMismatch);
    assert_eq!(alerts[0].details["table"], "users");
}

#[tokio::test]
async fn inserted_row_missing_is_a_mismatch() {
    let h = healthy();
    h.repo
        .insert_and_get_id(
            INSERT_USER,
            &params! { "Name" => "Ada", "Age" => 36 },
            "id",
            QueryOptions::new(),
        )
        .await
        .unwrap();
    let verification = h.audit.records()[0].verification.clone().unwrap();
    assert_eq!(verification.details["reason"], "row_missing");
}

#[tokio::test]
async fn update_compares_set_clause() {
    let h = healthy();
    h.primary
        .store_row(params! { "id" => 3, "status" => "closed" });

    h.repo
        .query(
            "UPDATE requests SET status = @Status WHERE id = @Id",
            &params! { "Status" => "closed", "Id" => 3 },
            QueryOptions::new(),
        )
        .await
        .unwrap();
    let verification = h.audit.records()[0].verification.clone().unwrap();
    assert_eq!(verification.status, VerificationStatus::Ok);
    assert_eq!(
        h.primary.executed()[1],
        "SELECT * FROM requests WHERE id = @VerifyValue"
    );

    h.repo
        .query(
            "UPDATE requests SET status = @Status WHERE id = @Id",
            &params! { "Status" => "open", "Id" => 3 },
            QueryOptions::new(),
        )
        .await
        .unwrap();
    let verification = h.audit.records()[1].verification.clone().unwrap();
    assert_eq!(verification.status, VerificationStatus::Mismatch);
}

#[tokio::test]
async fn text_key_is_matched_against_column_text() {
    let h = healthy();
    h.primary.store_row(params! {
        "id" => "6f1c2d9e-8a4b-4c3d-9e2f-1a2b3c4d5e6f",
        "status" => "closed",
    });

    h.repo
        .query(
            "UPDATE requests SET status = @Status WHERE id = @Id",
            &params! { "Status" => "closed", "Id" => "6f1c2d9e-8a4b-4c3d-9e2f-1a2b3c4d5e6f" },
            QueryOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        h.primary.executed()[1],
        "SELECT * FROM requests WHERE CAST(id AS TEXT) = @VerifyValue"
    );
    let verification = h.audit.records()[0].verification.clone().unwrap();
    assert_eq!(verification.status, VerificationStatus::Ok);
}

#[tokio::test]
async fn delete_checks_row_is_gone() {
    let h = healthy();
    h.primary.store_row(params! { "id" => 3 });
    h.repo
        .query(
            "DELETE FROM sessions WHERE id = @Id",
            &params! { "Id" => 3 },
            QueryOptions::new(),
        )
        .await
        .unwrap();
    let verification = h.audit.records()[0].verification.clone().unwrap();
    assert_eq!(verification.details["reason"], "row_still_exists");

    h.primary.clear_row();
    h.repo
        .query(
            "DELETE FROM sessions WHERE id = @Id",
            &params! { "Id" => 3 },
            QueryOptions::new(),
        )
        .await
        .unwrap();
    let verification = h.audit.records()[1].verification.clone().unwrap();
    assert_eq!(verification.status, VerificationStatus::Ok);
}

#[tokio::test]
async fn failing_lookup_is_failed_not_mismatch() {
    let h = healthy();
    h.primary.fail_reads();
    h.repo
        .insert_and_get_id(
            INSERT_USER,
            &params! { "Name" => "Ada", "Age" => 36 },
            "id",
            QueryOptions::new(),
        )
        .await
        .unwrap();
    let verification = h.audit.records()[0].verification.clone().unwrap();
    assert_eq!(verification.status, VerificationStatus::Failed);
    assert!(h.alerts.alerts().is_empty());
}

#[tokio::test]
async fn uninferable_shape_is_skipped() {
    let h = healthy();
    h.repo
        .query(
            "UPDATE t SET a = @A FROM other o WHERE t.id = o.id",
            &params! { "A" => 1 },
            QueryOptions::new(),
        )
        .await
        .unwrap();
    let verification = h.audit.records()[0].verification.clone().unwrap();
    assert_eq!(verification.status, VerificationStatus::Skipped);
    assert_eq!(verification.details["reason"], "table_not_inferred");
}

#[tokio::test]
async fn explicit_metadata_wins_over_inference() {
    let h = healthy();
    h.primary
        .store_row(params! { "request_id" => 9, "state" => "done" });
    h.repo
        .query(
            "UPDATE t SET a = @A FROM other o WHERE t.id = o.id",
            &params! { "A" => 1 },
            QueryOptions::new()
                .table("requests")
                .lookup("request_id", "Rid")
                .expected(params! { "state" => "done" }),
        )
        .await
        .unwrap();
    // The lookup parameter is not among the statement's params.
    let verification = h.audit.records()[0].verification.clone().unwrap();
    assert_eq!(verification.details["reason"], "where_param_missing");
}

#[tokio::test]
async fn verification_can_be_turned_off() {
    let h = Harness::new(
        SpyAdapter::healthy(Backend::Primary),
        SpyAdapter::healthy(Backend::Legacy),
        &[("DB_VERIFY_WRITES", "false")],
    );
    h.repo
        .insert_and_get_id(
            INSERT_USER,
            &params! { "Name" => "Ada", "Age" => 36 },
            "id",
            QueryOptions::new(),
        )
        .await
        .unwrap();
    assert!(h.audit.records()[0].verification.is_none());
    assert_eq!(h.primary.calls(), 1);

    // Per-call override forces it back on.
    h.repo
        .insert_and_get_id(
            INSERT_USER,
            &params! { "Name" => "Ada", "Age" => 36 },
            "id",
            QueryOptions::new().verify(true),
        )
        .await
        .unwrap();
    assert!(h.audit.records()[1].verification.is_some());
}

#[tokio::test]
async fn json_fields_are_reported_unchecked() {
    let h = healthy();
    h.primary.store_row(params! {
        "id" => 7,
        "name" => "Ada",
        "prefs" => serde_json::json!({"theme": "light"}),
    });
    h.repo
        .insert_and_get_id(
            "INSERT INTO users (name, prefs) VALUES (@Name, @Prefs)",
            &params! { "Name" => "Ada", "Prefs" => serde_json::json!({"theme": "dark"}) },
            "id",
            QueryOptions::new(),
        )
        .await
        .unwrap();
    let verification = h.audit.records()[0].verification.clone().unwrap();
    assert_eq!(verification.status, VerificationStatus::Ok);
    assert_eq!(
        verification.details["unchecked_fields"],
        serde_json::json!(["prefs"])
    );
}
