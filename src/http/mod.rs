//! Coordinator network API: axum server and reqwest client sharing one envelope.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};

pub use client::CoordinatorClient;
pub use server::{build_router, serve, AppState};

/// Every response body: an explicit business status plus optional data or message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            message: None,
        }
    }
}
