use std::sync::OnceLock;

use axum::http::{HeaderName, HeaderValue};
use axum_extra::{
    headers::{self, Header},
    typed_header::TypedHeaderRejection,
    TypedHeader,
};
use regex::Regex;
use uuid::Uuid;

use crate::errors::AppError;

pub static MCP_SESSION_ID: HeaderName = HeaderName::from_static("mcp-session-id");

/// `Mcp-Session-Id`: 1 to 256 visible ASCII characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpSessionId(pub String);

fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[\x21-\x7E]{1,256}$").expect("static session id pattern"))
}

pub fn is_valid_session_id(value: &str) -> bool {
    session_id_pattern().is_match(value)
}

impl Header for McpSessionId {
    fn name() -> &'static HeaderName {
        &MCP_SESSION_ID
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let value = value.to_str().map_err(|_| headers::Error::invalid())?;
        if !is_valid_session_id(value) {
            return Err(headers::Error::invalid());
        }
        Ok(Self(value.to_string()))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

/// Uses the caller's session id when present, mints one when absent, and
/// rejects malformed ids.
pub fn resolve_session_id(
    header: Result<TypedHeader<McpSessionId>, TypedHeaderRejection>,
) -> Result<String, AppError> {
    match header {
        Ok(TypedHeader(McpSessionId(id))) => Ok(id),
        Err(rejection) if rejection.is_missing() => Ok(Uuid::new_v4().to_string()),
        Err(_) => Err(AppError::bad_request(
            "invalid_session_id",
            "Mcp-Session-Id must be 1-256 visible ASCII characters",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(raw: &str) -> Result<McpSessionId, headers::Error> {
        let value = HeaderValue::from_str(raw).expect("header value");
        McpSessionId::decode(&mut std::iter::once(&value))
    }

    #[test]
    fn accepts_uuid_and_opaque_ids() {
        assert_eq!(
            decode("3f2b8c1e-0000-4000-8000-000000000000").expect("uuid id"),
            McpSessionId("3f2b8c1e-0000-4000-8000-000000000000".to_string())
        );
        assert!(decode("client:abc/123").is_ok());
    }

    #[test]
    fn rejects_spaces_and_oversized_ids() {
        assert!(decode("has space").is_err());
        assert!(decode(&"a".repeat(257)).is_err());
        assert!(decode(&"a".repeat(256)).is_ok());
    }

    #[test]
    fn rejects_empty_header() {
        assert!(!is_valid_session_id(""));
        assert!(decode("").is_err());
    }

    #[test]
    fn encodes_value_verbatim() {
        let mut values = Vec::new();
        McpSessionId("s-1".to_string()).encode(&mut values);
        assert_eq!(values, vec![HeaderValue::from_static("s-1")]);
    }
}
