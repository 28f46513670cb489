// Bearer-token plumbing shared by the HTTP handlers and the websocket
// handshake.
use crate::services::identity::API_KEY_PREFIX;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub fn looks_like_api_key(token: &str) -> bool {
    token.trim().starts_with(API_KEY_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_round_trips() {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_static("Bearer clk_0123456789abcdef"),
        );
        assert_eq!(
            extract_bearer_token(&headers).as_deref(),
            Some("clk_0123456789abcdef")
        );
    }

    #[test]
    fn missing_or_blank_header_yields_none() {
        let headers = HeaderMap::new();
        assert!(extract_bearer_token(&headers).is_none());
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(extract_bearer_token(&headers).is_none());
    }

    #[test]
    fn api_keys_are_prefix_checked() {
        assert!(looks_like_api_key("clk_abc"));
        assert!(!looks_like_api_key("wund_abc"));
    }
}
