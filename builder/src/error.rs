// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Maps [`buildfarm_core::error::CoreError`] onto HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use buildfarm_core::error::{CapacityError, CoreError};
use serde::Serialize;

/// JSON error body returned to HTTP callers.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Human-readable error message.
    pub error: String,
}

/// Newtype so `CoreError` can implement axum's `IntoResponse` without
/// violating the orphan rule from within this binary crate.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) | CoreError::DuplicateJobId(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Capacity(CapacityError::QueueEmpty | CapacityError::QueueFull(_) | CapacityError::BuilderAtCapacity(_) | CapacityError::GlobalCapReached(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::Capacity(_) => StatusCode::CONFLICT,
            CoreError::TransientRemote { .. } => StatusCode::BAD_GATEWAY,
            CoreError::Execution(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::Durability(_) | CoreError::Invariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}
