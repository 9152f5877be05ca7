//! Shared-secret authentication

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::{Error, Result, AUTH_HEADER};

/// Read the presented secret from request headers
pub fn token_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok())
}

/// Compare the presented secret with the expected one in constant time.
///
/// An empty expected secret rejects every request.
pub fn verify_token(expected: &str, presented: Option<&str>) -> Result<()> {
    let Some(presented) = presented else {
        return Err(Error::Unauthorized(format!("missing {} header", AUTH_HEADER)));
    };
    if expected.is_empty() {
        return Err(Error::Unauthorized("no token configured".into()));
    }
    if bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
        Ok(())
    } else {
        Err(Error::Unauthorized("token mismatch".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn matching_token_passes() {
        assert!(verify_token("s3cret", Some("s3cret")).is_ok());
    }

    #[test]
    fn mismatched_missing_or_unconfigured_tokens_fail() {
        assert!(matches!(
            verify_token("s3cret", Some("s3cre")),
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            verify_token("s3cret", None),
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            verify_token("", Some("")),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn token_is_read_from_auth_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(token_from_headers(&headers), None);
        headers.insert(AUTH_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(token_from_headers(&headers), Some("abc"));
    }
}
