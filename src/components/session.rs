//! Session identity
//!
//! Mints and validates the opaque per-client session token that makes
//! weighted routing decisions sticky. The token lives in a client-side
//! cookie; the server holds no session state.

use crate::error::ForkliftError;
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use hyper::header::COOKIE;
use hyper::HeaderMap;
use rand::{rngs::OsRng, RngCore};

pub const SESSION_COOKIE_NAME: &str = "forklift_id";
/// 30 days.
pub const SESSION_COOKIE_MAX_AGE: u64 = 86400 * 30;
pub const MAX_SESSION_ID_LENGTH: usize = 128;
const SESSION_ID_BYTES: usize = 32;

/// Generate a new random session id: 32 bytes of CSPRNG output, URL-safe
/// base64 encoded.
pub fn generate_session_id() -> Result<String, ForkliftError> {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| ForkliftError::SessionGeneration(e.to_string()))?;
    Ok(URL_SAFE.encode(bytes))
}

/// A session id is valid when it is non-empty, at most 128 bytes, and
/// decodes as URL-safe base64.
pub fn is_valid_session_id(session_id: &str) -> bool {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LENGTH {
        return false;
    }
    URL_SAFE.decode(session_id).is_ok()
}

/// Look up a cookie by exact name across all `Cookie` headers.
pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(header) = header.to_str() else { continue };
        for pair in header.split(';') {
            if let Some((cookie_name, value)) = pair.trim().split_once('=') {
                if cookie_name.trim() == name {
                    return Some(value.trim().trim_matches('"').to_string());
                }
            }
        }
    }
    None
}

/// Build the `Set-Cookie` header value for a freshly minted session id.
///
/// `Secure` is attached only when the request arrived over TLS.
pub fn session_cookie(session_id: &str, secure: bool) -> String {
    let mut parts = vec![
        format!("{}={}", SESSION_COOKIE_NAME, session_id),
        "Path=/".to_string(),
        format!("Max-Age={}", SESSION_COOKIE_MAX_AGE),
        "HttpOnly".to_string(),
    ];
    if secure {
        parts.push("Secure".to_string());
    }
    parts.push("SameSite=Strict".to_string());
    parts.join("; ")
}

/// Return the request's session id, minting a fresh one when the cookie is
/// absent, empty, or invalid. The second element is the `Set-Cookie` value
/// to attach to the response when a new id was minted.
pub fn get_or_create_session_id(
    headers: &HeaderMap,
    secure: bool,
) -> Result<(String, Option<String>), ForkliftError> {
    if let Some(existing) = cookie_value(headers, SESSION_COOKIE_NAME) {
        if is_valid_session_id(&existing) {
            return Ok((existing, None));
        }
    }

    let session_id = generate_session_id()?;
    let cookie = session_cookie(&session_id, secure);
    Ok((session_id, Some(cookie)))
}
