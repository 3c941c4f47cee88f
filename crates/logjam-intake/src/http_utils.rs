// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use http_body_util::Full;
use hyper::{header, http, Response, StatusCode};
use serde_json::json;
use tracing::{debug, error};

/// Response body used by every intake endpoint.
pub type Body = Full<Bytes>;
pub type HttpResponse = Response<Body>;

/// Does two things:
/// 1. Logs the given message. Success and client error statuses are logged at debug, server
///    errors at error.
/// 2. Returns the given message in the body of JSON response with the given status code.
///
/// Response body format:
/// {
///     "message": message
/// }
pub fn log_and_create_http_response(
    message: &str,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    if status.is_server_error() {
        error!("{message}");
    } else {
        debug!("{message}");
    }
    let body = json!({ "message": message }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
}

pub fn create_text_response(text: &'static str, status: StatusCode) -> http::Result<HttpResponse> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(text))
}

pub fn create_html_response(html: &'static str) -> http::Result<HttpResponse> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(html))
}

pub fn create_json_response(
    value: &serde_json::Value,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
}
