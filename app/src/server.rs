//! HTTP surface.
//!
//! Three routes: the claim endpoint, the voucher detail read and a liveness
//! probe. The authenticated user id arrives out-of-band in the `X-User-Id`
//! header; session handling lives in front of this service.

use crate::admission::SeckillService;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flashsale_core::error::AdmissionError;
use flashsale_core::types::{OrderId, UserId, Voucher, VoucherId};
use serde::Serialize;
use tracing::error;

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Error body returned to clients.
///
/// The `code` is stable; the `message` is human-readable and may change.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

/// HTTP-mapped error for the claim and read handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        let message = err.to_string();
        match err {
            AdmissionError::UnknownVoucher(_) => {
                Self::new(StatusCode::NOT_FOUND, "UNKNOWN_VOUCHER", message)
            }
            AdmissionError::NotStarted => {
                Self::new(StatusCode::CONFLICT, "NOT_STARTED", message)
            }
            AdmissionError::Ended => Self::new(StatusCode::CONFLICT, "ENDED", message),
            AdmissionError::OutOfStock => {
                Self::new(StatusCode::CONFLICT, "OUT_OF_STOCK", message)
            }
            AdmissionError::DuplicateClaim => {
                Self::new(StatusCode::CONFLICT, "DUPLICATE_CLAIM", message)
            }
            AdmissionError::StoreUnavailable(_) | AdmissionError::DurableUnavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, code = self.code, message = %self.message, "request failed");
        }
        let body = ErrorResponse {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Successful claim body.
#[derive(Debug, Serialize)]
struct SeckillResponse {
    order_id: OrderId,
}

/// Build the application router.
pub fn router(service: SeckillService) -> Router {
    Router::new()
        .route("/seckill/:voucher_id", post(seckill))
        .route("/vouchers/:voucher_id", get(voucher_detail))
        .route("/health", get(health_check))
        .with_state(service)
}

/// `POST /seckill/{voucher_id}`: claim one unit for the calling user.
async fn seckill(
    State(service): State<SeckillService>,
    Path(voucher_id): Path<VoucherId>,
    headers: HeaderMap,
) -> Result<Json<SeckillResponse>, ApiError> {
    let user_id = user_id(&headers)?;
    let order_id = service.seckill(voucher_id, user_id).await?;
    Ok(Json(SeckillResponse { order_id }))
}

/// `GET /vouchers/{voucher_id}`: voucher detail, served stale-while-revalidate.
async fn voucher_detail(
    State(service): State<SeckillService>,
    Path(voucher_id): Path<VoucherId>,
) -> Result<Json<Voucher>, ApiError> {
    let voucher = service
        .voucher_detail(voucher_id)
        .await?
        .ok_or_else(|| AdmissionError::UnknownVoucher(voucher_id))?;
    Ok(Json(voucher))
}

/// `GET /health`: liveness probe, checks no dependencies.
#[allow(clippy::unused_async)]
async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

fn user_id(headers: &HeaderMap) -> Result<UserId, ApiError> {
    let raw = headers
        .get(USER_ID_HEADER)
        .ok_or_else(|| ApiError::bad_request("missing X-User-Id header"))?;
    raw.to_str()
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ApiError::bad_request("X-User-Id must be an integer user id"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn user_id_header_parses() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("42"));
        assert_eq!(user_id(&headers).unwrap(), UserId::new(42));
    }

    #[test]
    fn missing_or_garbled_header_is_a_bad_request() {
        let headers = HeaderMap::new();
        assert_eq!(user_id(&headers).unwrap_err().status, StatusCode::BAD_REQUEST);

        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("not-a-number"));
        assert_eq!(user_id(&headers).unwrap_err().status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn admission_errors_map_to_stable_codes() {
        let err = ApiError::from(AdmissionError::OutOfStock);
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "OUT_OF_STOCK");

        let err = ApiError::from(AdmissionError::UnknownVoucher(VoucherId::new(9)));
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = ApiError::from(AdmissionError::DurableUnavailable("down".to_string()));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
