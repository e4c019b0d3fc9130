use axum::http::HeaderMap;

#[cfg(test)]
mod tests;

/// Signed identity assertion added by the proxy
pub const IAP_ASSERTION_HEADER: &str = "x-goog-iap-jwt-assertion";

/// Authenticated user email added by the proxy (unsigned)
pub const IAP_EMAIL_HEADER: &str = "x-goog-authenticated-user-email";

/// Prefix the proxy puts in front of the email
const ACCOUNTS_PREFIX: &str = "accounts.google.com:";

/// Extract the proxy's signed identity assertion
///
/// Returns the raw JWT; it still has to be verified.
pub fn extract_iap_assertion(headers: &HeaderMap) -> Result<String, HeaderError> {
    let value = header_str(headers, IAP_ASSERTION_HEADER)?.trim();

    if value.is_empty() {
        return Err(HeaderError::Empty);
    }

    // A JWT is three dot-separated segments
    if value.split('.').count() != 3 {
        return Err(HeaderError::InvalidFormat);
    }

    Ok(value.to_string())
}

/// Extract the authenticated user email set by the proxy
///
/// Expected format: "accounts.google.com:<email>"
/// The value is not signed; only use it to cross-check a verified assertion.
pub fn extract_authenticated_email(headers: &HeaderMap) -> Result<String, HeaderError> {
    let value = header_str(headers, IAP_EMAIL_HEADER)?;
    parse_authenticated_email(value)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, HeaderError> {
    headers
        .get(name)
        .ok_or(HeaderError::Missing)?
        .to_str()
        .map_err(|_| HeaderError::InvalidFormat)
}

/// Parse email from the authenticated-user header value
///
/// Internal helper for extract_authenticated_email
fn parse_authenticated_email(header_value: &str) -> Result<String, HeaderError> {
    let email = header_value
        .trim()
        .strip_prefix(ACCOUNTS_PREFIX)
        .unwrap_or(header_value.trim());

    if email.is_empty() {
        return Err(HeaderError::Empty);
    }

    if !email.contains('@') {
        return Err(HeaderError::InvalidFormat);
    }

    Ok(email.to_string())
}

/// Header extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum HeaderError {
    /// Header not present
    Missing,
    /// Not valid ASCII or not in the expected shape
    InvalidFormat,
    /// Header present but empty
    Empty,
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderError::Missing => write!(f, "Identity header not provided"),
            HeaderError::InvalidFormat => write!(f, "Invalid identity header format"),
            HeaderError::Empty => write!(f, "Identity header is empty"),
        }
    }
}

impl std::error::Error for HeaderError {}
