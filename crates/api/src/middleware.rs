use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::app::AppState;

pub const INTERNAL_API_KEY_HEADER: &str = "x-internal-api-key";

/// Reject requests whose `X-Internal-Api-Key` does not match the configured
/// key. With no key configured every request is rejected.
pub async fn require_internal_key(
    State(state): State<AppState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected = state.internal_api_key.as_deref().ok_or(StatusCode::UNAUTHORIZED)?;
    let presented = extract_key(req.headers())?;

    if !constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}

fn extract_key(headers: &HeaderMap) -> Result<&str, StatusCode> {
    let key = headers
        .get(INTERNAL_API_KEY_HEADER)
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_str()
        .map_err(|_| StatusCode::UNAUTHORIZED)?
        .trim();

    if key.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(key)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_comparison() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
    }

    #[test]
    fn blank_header_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(INTERNAL_API_KEY_HEADER, "   ".parse().unwrap());
        assert_eq!(extract_key(&headers), Err(StatusCode::UNAUTHORIZED));
        assert_eq!(extract_key(&HeaderMap::new()), Err(StatusCode::UNAUTHORIZED));
    }
}
