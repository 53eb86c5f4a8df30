//! Converting binary data to a `data:` URL.

use base64::{Engine as _, prelude::BASE64_STANDARD};

/// Convert binary data to a `data:` URL.
///
/// The Base64 payload is not percent-encoded. Vision APIs accept it as-is, and
/// several reject the percent-encoded form.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, BASE64_STANDARD.encode(data))
}
