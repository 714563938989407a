//! HTTP responses for gateway errors.

use std::convert::Infallible;
use std::io;

use bytes::Bytes;
use http_body::combinators::UnsyncBoxBody;
use http_body::{Body as _, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use jitreg_core::GatewayError;

/// Body type of every gateway response.
pub type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

/// Status code a gateway error is reported with.
///
/// A build runs on behalf of the request that triggered it, so whatever
/// went wrong upstream or on disk is the gateway's failure to produce the
/// image.
pub fn gateway_error_status(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::BuildError { .. }
        | GatewayError::RegistryError { .. }
        | GatewayError::IoError(_)
        | GatewayError::SerializationError(_)
        | GatewayError::ConfigError(_)
        | GatewayError::RuleError(_)
        | GatewayError::WatchError(_)
        | GatewayError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a GatewayError to a plain-text response carrying its message.
pub fn gateway_error_to_response(err: &GatewayError) -> Response<ResponseBody> {
    text_response(gateway_error_status(err), err.to_string())
}

/// Plain-text response with the given status.
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ResponseBody> {
    let body = Full::new(Bytes::from(message.into()))
        .map_err(|never: Infallible| -> io::Error { match never {} })
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
