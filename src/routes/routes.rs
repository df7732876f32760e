//! Routes for the upload broker.
//!
//! ## Structure
//! - **Probes**
//!   - `GET  /healthz`, `GET /readyz`
//!
//! - **Upload sessions** (bearer-authenticated)
//!   - `POST /api/files/init-upload` create a session, get upload URLs
//!   - `POST /api/files/{id}/ack-chunk` acknowledge one uploaded chunk
//!   - `GET  /api/files/{id}/status` progress snapshot
//!   - `POST /api/files/{id}/complete-upload` finalize
//!   - `POST /api/files/{id}/abort` abandon an upload
//!   - `POST /api/files/{id}/chunks/{index}/refresh` reissue one upload URL
//!   - `GET  /api/files/{id}/download-urls` ranged download URLs

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        session_handlers::{
            abort_upload, ack_chunk, complete_upload, download_urls, init_upload,
            refresh_chunk_url, upload_status,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Build and return the router carrying `AppState` to all handlers.
pub fn routes() -> Router<AppState> {
    let files = Router::new()
        .route("/init-upload", post(init_upload))
        .route("/{id}/ack-chunk", post(ack_chunk))
        .route("/{id}/status", get(upload_status))
        .route("/{id}/complete-upload", post(complete_upload))
        .route("/{id}/abort", post(abort_upload))
        .route("/{id}/chunks/{index}/refresh", post(refresh_chunk_url))
        .route("/{id}/download-urls", get(download_urls));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/api/files", files)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::{JwtVerifier, testing::token_for},
        models::session::ProviderKind,
        providers::{ProviderRegistry, fake::FakeProvider},
        services::{
            selector::MigrationPolicy,
            session_repository::testing::memory_repository,
            upload_service::{SessionSettings, UploadService},
        },
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    const SECRET: &str = "router-secret";

    async fn app() -> Router {
        let repo = memory_repository().await;
        let db = repo.db.clone();
        let providers = ProviderRegistry::new()
            .with(Arc::new(FakeProvider::new(ProviderKind::B2)))
            .with(Arc::new(FakeProvider::new(ProviderKind::R2)));
        let uploads = UploadService::new(
            Arc::new(repo),
            providers,
            SessionSettings {
                chunk_size: 4,
                large_file_threshold: 100,
                session_ttl: chrono::Duration::days(3),
                abort_grace: chrono::Duration::hours(1),
                migration: MigrationPolicy::new(10),
            },
        );
        routes().with_state(AppState {
            uploads,
            auth: JwtVerifier::new(SECRET),
            db,
        })
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            let token = token_for(SECRET, user);
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn get(app: &Router, uri: &str, user: &str) -> (StatusCode, Value) {
        send(app, "GET", uri, Some(user), None).await
    }

    async fn post(app: &Router, uri: &str, user: &str) -> (StatusCode, Value) {
        send(app, "POST", uri, Some(user), None).await
    }

    #[tokio::test]
    async fn probes_respond() {
        let app = app().await;
        let (status, body) = send(&app, "GET", "/healthz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, "GET", "/readyz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["providers"], json!(["B2", "R2"]));
    }

    #[tokio::test]
    async fn requests_without_token_are_unauthorized() {
        let app = app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/files/init-upload",
            None,
            Some(json!({ "name": "a", "mimeType": "text/plain", "size": 3 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["status"], 401);
    }

    #[tokio::test]
    async fn full_upload_and_download_flow() {
        let app = app().await;
        let (status, created) = send(
            &app,
            "POST",
            "/api/files/init-upload",
            Some("alice"),
            Some(json!({
                "name": "notes.txt",
                "mimeType": "text/plain",
                "size": 6,
                "recipients": ["bob"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["chunkCount"], 2);
        assert_eq!(created["provider"], "B2");
        assert_eq!(created["presignedUrls"].as_array().unwrap().len(), 2);
        let id = created["sessionId"].as_str().unwrap().to_string();

        let (status, body) = get(&app, &format!("/api/files/{id}/download-urls"), "bob").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "not_ready");

        let (status, body) = post(&app, &format!("/api/files/{id}/complete-upload"), "alice").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["details"]["expected"], 2);

        for index in 0..2 {
            let (status, body) = send(
                &app,
                "POST",
                &format!("/api/files/{id}/ack-chunk"),
                Some("alice"),
                Some(json!({
                    "chunkIndex": index,
                    "checksum": format!("sum-{index}"),
                    "size": 4,
                    "etag": format!("sha-{index}")
                })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["acknowledged"], index + 1);
        }

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/files/{id}/ack-chunk"),
            Some("alice"),
            Some(json!({ "chunkIndex": 0, "checksum": "other", "size": 4 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "checksum_conflict");
        assert_eq!(body["details"]["expected"], "sum-0");

        let (status, body) = post(&app, &format!("/api/files/{id}/complete-upload"), "alice").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");

        let (status, body) = get(&app, &format!("/api/files/{id}/download-urls"), "bob").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["downloadCount"], 1);
        assert_eq!(body["presignedUrls"][1]["range"], json!({ "start": 4, "end": 5 }));

        let (status, _) = get(&app, &format!("/api/files/{id}/download-urls"), "mallory").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn refresh_rejects_out_of_range_index() {
        let app = app().await;
        let (_, created) = send(
            &app,
            "POST",
            "/api/files/init-upload",
            Some("alice"),
            Some(json!({ "name": "a", "mimeType": "text/plain", "size": 6 })),
        )
        .await;
        let id = created["sessionId"].as_str().unwrap().to_string();

        let uri = format!("/api/files/{id}/chunks/1/refresh");
        let (status, body) = post(&app, &uri, "alice").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["chunkIndex"], 1);

        let uri = format!("/api/files/{id}/chunks/9/refresh");
        let (status, body) = post(&app, &uri, "alice").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_index");
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_not_found() {
        let app = app().await;
        let (status, _) = send(
            &app,
            "GET",
            &format!("/api/files/{}/status", uuid::Uuid::new_v4()),
            Some("alice"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = post(&app, "/api/files/not-a-uuid/abort", "alice").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
