//! Synthetic responses served when neither the network nor the store can
//! answer.

use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderValue, StatusCode};
use skincache_net::Response;

pub const PLACEHOLDER_WIDTH: u32 = 400;
pub const PLACEHOLDER_HEIGHT: u32 = 300;

/// Plain-text 503 with body `Offline`.
pub fn offline_text() -> Response {
    Response::new(StatusCode::SERVICE_UNAVAILABLE, "Offline").with_header(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    )
}

/// JSON 503 with body `{"error": message}`.
pub fn offline_json(message: &str) -> Response {
    let body = serde_json::json!({ "error": message }).to_string();
    Response::new(StatusCode::SERVICE_UNAVAILABLE, body)
        .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
}

/// 200 SVG placeholder for images that are neither cached nor reachable.
pub fn placeholder_image() -> Response {
    let svg = format!(
        r##"<svg width="{w}" height="{h}" xmlns="http://www.w3.org/2000/svg"><rect width="100%" height="100%" fill="#1e293b"/><text x="50%" y="50%" text-anchor="middle" fill="#64748b" font-family="Arial" font-size="16">Image Unavailable Offline</text></svg>"##,
        w = PLACEHOLDER_WIDTH,
        h = PLACEHOLDER_HEIGHT,
    );
    Response::new(StatusCode::OK, svg)
        .with_header(CONTENT_TYPE, HeaderValue::from_static("image/svg+xml"))
        .with_header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
}
