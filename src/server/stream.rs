use axum::body::Body;
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use kiln_common::ConversionEvent;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::pipeline::SessionHandle;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
pub const SESSION_ID_HEADER: &str = "x-kiln-session-id";

/// Stream a session's events as newline-delimited JSON.
///
/// The body owns the event receiver; when the client goes away the body is
/// dropped, which the session sees as a disconnect at its next checkpoint.
pub fn ndjson_response(handle: SessionHandle) -> Response {
    let stream = ReceiverStream::new(handle.events).map(|event: ConversionEvent| event.to_line());

    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(value) = HeaderValue::from_str(&handle.session_id.to_string()) {
        headers.insert(SESSION_ID_HEADER, value);
    }
    response
}
