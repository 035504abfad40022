use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crucible_core::BrokerError;

/// Wrapper turning a [`BrokerError`] into an HTTP response with the error
/// kind in the body.
pub struct ApiError(pub BrokerError);

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BrokerError::InvalidArgument(_)
            | BrokerError::InvalidTool(_)
            | BrokerError::InvalidToolOutput(_)
            | BrokerError::WorkspaceProjectionFailed(_) => StatusCode::BAD_REQUEST,
            // Unknown, expired, and exhausted files all read as absent.
            BrokerError::NotFound(_)
            | BrokerError::Expired(_)
            | BrokerError::QuotaExhausted(_) => StatusCode::NOT_FOUND,
            BrokerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::ExecutionFailed(_) | BrokerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_kind() {
        let cases = [
            (BrokerError::InvalidArgument("x".into()), 400),
            (BrokerError::InvalidTool("x".into()), 400),
            (BrokerError::NotFound("x".into()), 404),
            (BrokerError::Expired("x".into()), 404),
            (BrokerError::QuotaExhausted("x".into()), 404),
            (BrokerError::Unavailable("x".into()), 503),
            (BrokerError::Internal("x".into()), 500),
        ];
        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status().as_u16(), expected);
        }
    }
}
