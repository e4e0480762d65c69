mod common;

use axum::http::StatusCode;
use common::{approve_all, TestApp, TestOptions, CSV_HEADER};
use expense_import_service::config::ImportLimits;
use rust_decimal::Decimal;
use serde_json::json;

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn may_csv() -> String {
    format!(
        "{}Sunset Villa,2024-05-03,Pool service,,100.10\n\
         sunset villa (OLD),05/10/2024,,,\"$20.05\"\n\
         Unknown Ave,2024-05-04,,,7.00\n",
        CSV_HEADER
    )
}

#[tokio::test]
async fn preview_then_confirm_updates_statement_totals() {
    let app = TestApp::spawn();
    app.store.seed_income(app.sunset_statement, dec("1000.00"));
    let before = app.store.statement(app.sunset_statement).unwrap();
    let expenses_before = app.store.expense_count();

    let preview = app.preview_csv(&may_csv()).await;
    assert_eq!(preview.status, StatusCode::OK, "{}", preview.body);
    assert_eq!(preview.body["status"], "PREVIEW_READY");
    assert_eq!(preview.body["degraded"], false);

    let summary = &preview.body["preview"]["summary"];
    assert_eq!(summary["matchedPropertyCount"], 1);
    assert_eq!(summary["unmatchedPropertyCount"], 1);
    assert_eq!(summary["matchedExpenseCount"], 2);
    assert_eq!(summary["unmatchedExpenseCount"], 1);

    let group = &preview.body["preview"]["matched"][0];
    assert_eq!(group["statementId"], app.sunset_statement.to_string());
    assert_eq!(
        group["identifiers"],
        json!(["Sunset Villa", "sunset villa (OLD)"])
    );
    assert_eq!(preview.body["preview"]["unmatched"][0]["propertyName"], "Unknown Ave");

    // Preview never writes
    assert_eq!(app.store.expense_count(), expenses_before);

    let job_id = preview.body["jobId"].as_str().unwrap().to_string();
    let confirmed = app.confirm(&job_id, &approve_all(&preview.body, false)).await;
    assert_eq!(confirmed.status, StatusCode::OK, "{}", confirmed.body);
    assert_eq!(confirmed.body["status"], "COMMITTED");
    assert_eq!(confirmed.body["committedRows"], 2);
    assert_eq!(confirmed.body["totalRows"], 2);
    assert_eq!(
        confirmed.body["statementsUpdated"],
        json!([app.sunset_statement.to_string()])
    );

    assert_eq!(app.store.expense_count(), expenses_before + 2);
    let after = app.store.statement(app.sunset_statement).unwrap();
    assert_eq!(after.total_expenses, before.total_expenses + dec("120.15"));
    assert_eq!(after.grand_total, before.grand_total - dec("120.15"));
    assert_eq!(after.updated_by, Some(app.user_id));

    let oak = app.store.statement(app.oak_statement).unwrap();
    assert_eq!(oak.total_expenses, Decimal::ZERO);

    let job = app.get(&format!("/imports/{}", job_id)).await;
    assert_eq!(job.status, StatusCode::OK);
    assert_eq!(job.body["status"], "COMMITTED");
    assert_eq!(job.body["committedRows"], 2);
}

#[tokio::test]
async fn imported_expenses_carry_defaults() {
    let app = TestApp::spawn();
    let csv = format!("{}Oak Court,,,,42\n", CSV_HEADER);

    let preview = app.preview_csv(&csv).await;
    let job_id = preview.body["jobId"].as_str().unwrap().to_string();
    let confirmed = app.confirm(&job_id, &approve_all(&preview.body, false)).await;
    assert_eq!(confirmed.status, StatusCode::OK, "{}", confirmed.body);

    let expenses = app.store.expenses_for(app.oak_statement);
    assert_eq!(expenses.len(), 1);
    assert_eq!(expenses[0].vendor, "Acme");
    assert_eq!(expenses[0].description, "Cleaning");
    assert_eq!(expenses[0].expense_date, app.month.default_expense_date());
    assert_eq!(expenses[0].amount, dec("42.00"));
}

#[tokio::test]
async fn duplicates_block_until_overridden() {
    let app = TestApp::spawn();
    app.store.seed_expense(
        app.sunset_statement,
        app.month.default_expense_date(),
        "Acme",
        "Cleaning",
        dec("15.00"),
    );
    let csv = format!("{}Sunset Villa,2024-05-03,,,100\n", CSV_HEADER);

    let preview = app.preview_csv(&csv).await;
    assert_eq!(preview.status, StatusCode::OK);
    assert_eq!(
        preview.body["possibleDuplicates"],
        json!([{ "vendor": "Acme", "description": "Cleaning" }])
    );

    let job_id = preview.body["jobId"].as_str().unwrap().to_string();
    let blocked = app.confirm(&job_id, &approve_all(&preview.body, false)).await;
    assert_eq!(blocked.status, StatusCode::CONFLICT);
    assert_eq!(blocked.body["code"], "possible_duplicate");
    assert_eq!(blocked.body["details"]["overridable"], true);
    assert_eq!(app.store.expenses_for(app.sunset_statement).len(), 1);

    let forced = app.confirm(&job_id, &approve_all(&preview.body, true)).await;
    assert_eq!(forced.status, StatusCode::OK, "{}", forced.body);
    assert_eq!(app.store.expenses_for(app.sunset_statement).len(), 2);
}

#[tokio::test]
async fn confirm_invalidates_duplicate_lookups() {
    let app = TestApp::spawn();
    let csv = format!("{}Sunset Villa,2024-05-03,,,100\n", CSV_HEADER);

    let first = app.preview_csv(&csv).await;
    assert_eq!(first.body["possibleDuplicates"], json!([]));
    let job_id = first.body["jobId"].as_str().unwrap().to_string();
    let confirmed = app.confirm(&job_id, &approve_all(&first.body, false)).await;
    assert_eq!(confirmed.status, StatusCode::OK);

    // The "not yet imported" answer cached by the first preview must be gone
    let second = app.preview_csv(&csv).await;
    assert_eq!(
        second.body["possibleDuplicates"],
        json!([{ "vendor": "Acme", "description": "Cleaning" }])
    );
}

#[tokio::test]
async fn failed_chunk_resumes_without_double_insert() {
    let app = TestApp::spawn_with(TestOptions {
        limits: ImportLimits {
            chunk_size: 1,
            ..ImportLimits::default()
        },
        ..TestOptions::default()
    });
    let csv = format!(
        "{}Sunset Villa,2024-05-01,Water,,10\nSunset Villa,2024-05-02,Power,,20\nOak Court,2024-05-03,Gas,,30\n",
        CSV_HEADER
    );

    let preview = app.preview_csv(&csv).await;
    let job_id = preview.body["jobId"].as_str().unwrap().to_string();
    let approval = approve_all(&preview.body, false);

    app.store.fail_chunk_commit(2);
    let partial = app.confirm(&job_id, &approval).await;
    assert_eq!(partial.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(partial.body["code"], "partial_commit_failure");
    assert_eq!(partial.body["details"]["committedRows"], 1);
    assert_eq!(partial.body["details"]["remainingRows"], 2);
    assert_eq!(partial.body["details"]["totalRows"], 3);
    assert_eq!(app.store.expense_count(), 1);

    let job = app.get(&format!("/imports/{}", job_id)).await;
    assert_eq!(job.body["status"], "PARTIALLY_COMMITTED");

    let resumed = app.confirm(&job_id, &approval).await;
    assert_eq!(resumed.status, StatusCode::OK, "{}", resumed.body);
    assert_eq!(resumed.body["status"], "COMMITTED");
    assert_eq!(resumed.body["committedRows"], 3);
    assert_eq!(resumed.body["skippedRows"], 1);
    assert_eq!(app.store.expense_count(), 3);

    let sunset = app.store.statement(app.sunset_statement).unwrap();
    assert_eq!(sunset.total_expenses, dec("30.00"));
    let oak = app.store.statement(app.oak_statement).unwrap();
    assert_eq!(oak.total_expenses, dec("30.00"));
}

#[tokio::test]
async fn cancelled_job_cannot_be_confirmed() {
    let app = TestApp::spawn();
    let csv = format!("{}Sunset Villa,2024-05-03,,,100\n", CSV_HEADER);

    let preview = app.preview_csv(&csv).await;
    let job_id = preview.body["jobId"].as_str().unwrap().to_string();

    let cancelled = app
        .post_json(&format!("/imports/{}/cancel", job_id), &json!({}))
        .await;
    assert_eq!(cancelled.status, StatusCode::OK);
    assert_eq!(cancelled.body["status"], "CANCELLED");

    let confirmed = app.confirm(&job_id, &approve_all(&preview.body, false)).await;
    assert_eq!(confirmed.status, StatusCode::CONFLICT);
    assert_eq!(confirmed.body["code"], "invalid_transition");
    assert_eq!(app.store.expense_count(), 0);
}

#[tokio::test]
async fn statement_outside_the_org_is_not_found() {
    let app = TestApp::spawn();
    let csv = format!("{}Sunset Villa,2024-05-03,,,100\n", CSV_HEADER);
    let preview = app.preview_csv(&csv).await;
    let job_id = preview.body["jobId"].as_str().unwrap().to_string();

    let other_org = uuid::Uuid::new_v4();
    let property = app.store.seed_property(other_org, "Sunset Villa", None);
    let foreign = app.store.seed_statement(other_org, property, app.month);

    let mut body = approve_all(&preview.body, false);
    body["targetStatementId"] = json!(foreign);
    let confirmed = app.confirm(&job_id, &body).await;
    assert_eq!(confirmed.status, StatusCode::NOT_FOUND);
    assert_eq!(confirmed.body["code"], "not_found");

    let mut body = approve_all(&preview.body, false);
    body["approvedMatches"][0]["statementId"] = json!(foreign);
    let confirmed = app.confirm(&job_id, &body).await;
    assert_eq!(confirmed.status, StatusCode::NOT_FOUND);
    assert_eq!(app.store.expense_count(), 0);
}

#[tokio::test]
async fn nothing_matched_is_unprocessable() {
    let app = TestApp::spawn();
    let csv = format!("{}Nowhere Lane,2024-05-03,,,100\n", CSV_HEADER);

    let response = app.preview_csv(&csv).await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response.body["code"], "no_properties_matched");
}

#[tokio::test]
async fn rejects_bad_uploads() {
    let app = TestApp::spawn();

    let bad_month = app
        .preview("may.csv", "text/csv", b"property,amount\nA,1\n", "May 2024")
        .await;
    assert_eq!(bad_month.status, StatusCode::BAD_REQUEST);

    let unsupported = app
        .preview("notes.txt", "text/plain", b"hello", "2024-05")
        .await;
    assert_eq!(unsupported.status, StatusCode::BAD_REQUEST);
    assert_eq!(unsupported.body["code"], "validation_error");

    let missing_columns = app
        .preview("may.csv", "text/csv", b"name,total\nA,1\n", "2024-05")
        .await;
    assert_eq!(missing_columns.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pdf_needs_the_ai_service() {
    let app = TestApp::spawn();

    let response = app
        .preview("may.pdf", "application/pdf", b"%PDF-1.4 test", "2024-05")
        .await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.body["code"], "ai_service_unavailable");
    assert_eq!(response.body["details"]["retryable"], true);
}

#[tokio::test]
async fn pdf_lines_come_from_the_model_reply() {
    let app = TestApp::spawn_with(TestOptions {
        ai_enabled: true,
        ..TestOptions::default()
    });
    app.provider.push_reply(
        "Here you go:\n```json\n{\"expenses\": [{\"property\": \"Sunset Villa\", \"date\": \"2024-05-02\", \"amount\": \"45.50\", \"description\": \"Filter\"}]}\n```",
    );

    let response = app
        .preview("may.pdf", "application/pdf", b"%PDF-1.4 test", "2024-05")
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.body);
    let group = &response.body["preview"]["matched"][0];
    assert_eq!(group["property"]["name"], "Sunset Villa");
    assert_eq!(group["expenses"][0]["description"], "Filter");
    assert_eq!(group["expenses"][0]["date"], "2024-05-02");
}

#[tokio::test]
async fn jobs_are_private_to_their_org() {
    let app = TestApp::spawn();
    let csv = format!("{}Sunset Villa,2024-05-03,,,100\n", CSV_HEADER);
    let preview = app.preview_csv(&csv).await;
    let job_id = preview.body["jobId"].as_str().unwrap();

    let request = axum::http::Request::builder()
        .uri(format!("/imports/{}", job_id))
        .header("X-Org-ID", uuid::Uuid::new_v4().to_string())
        .header("X-User-ID", app.user_id.to_string())
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}
