//! Terminal response for when neither the cache nor the origin can answer.

use crate::http::{Response, StatusCode};

pub const UNAVAILABLE_BODY: &str =
    "Service Unavailable: the origin could not be reached and no cached copy exists.\n";

/// Fixed `503` response. Depends on nothing and cannot fail.
pub fn unavailable() -> Response {
    Response::new(StatusCode::SERVICE_UNAVAILABLE)
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("Cache-Control", "no-store")
        .body(UNAVAILABLE_BODY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_a_plain_503() {
        let response = unavailable();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("content-type"),
            Some("text/plain; charset=utf-8")
        );
        assert_eq!(response.body_ref().as_ref(), UNAVAILABLE_BODY.as_bytes());
    }
}
