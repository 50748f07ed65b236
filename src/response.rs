use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::UnsyncBoxBody};
use hyper::{Response, StatusCode, header};

use crate::error::GateError;

/// Body type for every response the gate writes, buffered or streamed.
///
/// Unsync because the streamed upstream body from `reqwest` is `Send` only.
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

pub fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> ResponseBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

pub fn text_response(status: StatusCode, message: &'static str) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub fn error_response(err: &GateError) -> Response<ResponseBody> {
    text_response(err.status(), err.public_message())
}
