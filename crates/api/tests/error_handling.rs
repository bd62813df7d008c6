//! `AppError` to HTTP response mapping, exercised through `IntoResponse`
//! without a server.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use http_body_util::BodyExt;
use rigger_api::error::AppError;
use rigger_core::entity::{EntityKind, EntityRef};
use rigger_core::error::CoreError;

async fn error_to_response(err: AppError) -> (StatusCode, serde_json::Value) {
    let response = err.into_response();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

#[tokio::test]
async fn not_found_error_returns_404() {
    let err = AppError::Core(CoreError::NotFound {
        entity: "Host",
        id: 42,
    });

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
    assert_eq!(json["error"], "Host with id 42 not found");
}

#[tokio::test]
async fn unknown_template_returns_404() {
    let err = AppError::Core(CoreError::TemplateNotFound("format-disk".into()));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "TEMPLATE_NOT_FOUND");
    assert_eq!(json["error"], "Script template not found: format-disk");
}

#[tokio::test]
async fn render_error_returns_422_with_reason() {
    let err = AppError::Core(CoreError::render("create-user", "username must not be empty"));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["code"], "RENDER_ERROR");
    assert!(json["error"]
        .as_str()
        .unwrap()
        .contains("username must not be empty"));
}

#[tokio::test]
async fn bad_request_error_returns_400() {
    let err = AppError::BadRequest("name must not be blank".into());

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
    assert_eq!(json["error"], "name must not be blank");
}

#[tokio::test]
async fn conflict_error_returns_409() {
    let err = AppError::Core(CoreError::Conflict("Host 3 is provisioned".into()));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "CONFLICT");
    assert_eq!(json["error"], "Host 3 is provisioned");
}

#[tokio::test]
async fn engine_errors_are_sanitized() {
    let errors = [
        CoreError::MetadataKeyNotFound {
            key: "container_port".into(),
            entity: EntityRef::attempt(4),
            available: vec![],
            caller: "src/steps.rs:1:1".into(),
        },
        CoreError::UnsupportedEntity(EntityKind::ExecutionRecord),
        CoreError::Extraction("no container info returned".into()),
        CoreError::Internal("boom".into()),
    ];

    for err in errors {
        let (status, json) = error_to_response(AppError::Core(err)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["code"], "INTERNAL_ERROR");
        assert_eq!(json["error"], "An internal error occurred");
    }
}

#[tokio::test]
async fn row_not_found_returns_404() {
    let (status, json) = error_to_response(AppError::Database(sqlx::Error::RowNotFound)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
}

#[tokio::test]
async fn other_database_errors_are_sanitized() {
    let (status, json) = error_to_response(AppError::Database(sqlx::Error::PoolTimedOut)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "An internal error occurred");
}
