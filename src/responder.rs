use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    header::{self, HeaderValue},
    Request, Response,
};

pub const BODY: &[u8] = b"1";
pub const CONTENT_TYPE: &str = "text/plain; charset=utf-8";
pub const SERVER_NAME: &str = "ammo-target";

/// Answers every request with `200 OK` and the body `1`.
///
/// Only the `Connection` header is looked at, so that a client asking to
/// close gets `connection: close` back. Content length is filled in by hyper
/// from the body size.
pub fn respond<B>(req: Request<B>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(BODY)));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
    // hyper adds this on its own when keep-alive is off; set it here so the
    // replay check does not depend on that.
    if wants_close(req.headers()) {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

/// Whether any `Connection` header carries the `close` token.
pub fn wants_close(headers: &hyper::HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}
