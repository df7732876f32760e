use crate::{auth::JwtVerifier, services::upload_service::UploadService};
use axum::extract::FromRef;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub uploads: UploadService,
    pub auth: JwtVerifier,
    pub db: Arc<SqlitePool>,
}

impl FromRef<AppState> for JwtVerifier {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}
