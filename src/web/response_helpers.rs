// HTTP response helper functions shared by route handlers

use hyper::{Body, Response, StatusCode};
use serde::Serialize;
use serde_json::json;

/// Standard CORS headers
const CORS_ORIGIN: &str = "*";
const CORS_METHODS: &str = "GET, POST, OPTIONS";
const CORS_HEADERS: &str = "content-type, authorization";

fn with_cors(status: StatusCode) -> hyper::http::response::Builder {
    Response::builder()
        .status(status)
        .header("access-control-allow-origin", CORS_ORIGIN)
        .header("access-control-allow-methods", CORS_METHODS)
        .header("access-control-allow-headers", CORS_HEADERS)
}

/// Build a raw JSON string response
pub fn json_raw(status: StatusCode, json: String) -> Response<Body> {
    let builder = with_cors(status).header("content-type", "application/json");
    match builder.body(Body::from(json)) {
        Ok(response) => response,
        // Only reachable with an invalid header value; fall back to a bare response.
        Err(_) => Response::new(Body::empty()),
    }
}

/// Build a JSON response with CORS headers
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let json = serde_json::to_string(body)
        .unwrap_or_else(|_| r#"{"detail":"Serialization failed"}"#.to_string());
    json_raw(status, json)
}

/// Build a JSON error response: `{"detail": message}`
pub fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json_raw(status, json!({ "detail": message }).to_string())
}

/// 429 with a `Retry-After` advisory.
pub fn busy_response(message: &str, retry_after_s: u64) -> Response<Body> {
    let mut response = json_error(StatusCode::TOO_MANY_REQUESTS, message);
    response
        .headers_mut()
        .insert("retry-after", hyper::header::HeaderValue::from(retry_after_s));
    response
}

/// CORS preflight response
pub fn cors_preflight() -> Response<Body> {
    match with_cors(StatusCode::OK).body(Body::empty()) {
        Ok(response) => response,
        Err(_) => Response::new(Body::empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_json_error_uses_detail() {
        let response = json_error(StatusCode::BAD_REQUEST, "Test error");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert_eq!(body_json(response).await["detail"], "Test error");
    }

    #[tokio::test]
    async fn test_json_error_escapes_quotes() {
        let response = json_error(StatusCode::BAD_REQUEST, r#"Error "quoted""#);
        assert_eq!(body_json(response).await["detail"], r#"Error "quoted""#);
    }

    #[test]
    fn test_busy_response_header() {
        let response = busy_response("Busy", 1);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "1");
        assert_eq!(response.headers()["content-type"], "application/json");
    }

    #[test]
    fn test_preflight() {
        let response = cors_preflight();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("access-control-allow-methods"));
    }
}
