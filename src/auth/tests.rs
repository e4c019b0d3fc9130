use super::*;
use axum::http::HeaderMap;

const ASSERTION: &str = "eyJhbGciOiJFUzI1NiIsImtpZCI6ImtleS0xIn0.eyJlbWFpbCI6InUxQGV4YW1wbGUuY29tIn0.c2ln";

#[cfg(test)]
mod extract_iap_assertion_tests {
    use super::*;

    #[test]
    fn valid_assertion() {
        let mut headers = HeaderMap::new();
        headers.insert(IAP_ASSERTION_HEADER, ASSERTION.parse().unwrap());

        assert_eq!(extract_iap_assertion(&headers).unwrap(), ASSERTION);
    }

    #[test]
    fn surrounding_whitespace_trimmed() {
        let mut headers = HeaderMap::new();
        headers.insert(
            IAP_ASSERTION_HEADER,
            format!("  {}  ", ASSERTION).parse().unwrap(),
        );

        assert_eq!(extract_iap_assertion(&headers).unwrap(), ASSERTION);
    }

    #[test]
    fn missing_header() {
        let headers = HeaderMap::new();
        assert_eq!(extract_iap_assertion(&headers), Err(HeaderError::Missing));
    }

    #[test]
    fn empty_header() {
        let mut headers = HeaderMap::new();
        headers.insert(IAP_ASSERTION_HEADER, "".parse().unwrap());

        assert_eq!(extract_iap_assertion(&headers), Err(HeaderError::Empty));
    }

    #[test]
    fn not_a_jwt() {
        let mut headers = HeaderMap::new();
        headers.insert(IAP_ASSERTION_HEADER, "opaque-token".parse().unwrap());

        assert_eq!(
            extract_iap_assertion(&headers),
            Err(HeaderError::InvalidFormat)
        );
    }

    #[test]
    fn authorization_header_is_not_used() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {}", ASSERTION).parse().unwrap(),
        );

        assert_eq!(extract_iap_assertion(&headers), Err(HeaderError::Missing));
    }
}

#[cfg(test)]
mod extract_authenticated_email_tests {
    use super::*;

    #[test]
    fn strips_accounts_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(
            IAP_EMAIL_HEADER,
            "accounts.google.com:u1@example.com".parse().unwrap(),
        );

        assert_eq!(
            extract_authenticated_email(&headers).unwrap(),
            "u1@example.com"
        );
    }

    #[test]
    fn accepts_bare_email() {
        let mut headers = HeaderMap::new();
        headers.insert(IAP_EMAIL_HEADER, "u1@example.com".parse().unwrap());

        assert_eq!(
            extract_authenticated_email(&headers).unwrap(),
            "u1@example.com"
        );
    }

    #[test]
    fn prefix_only_is_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(IAP_EMAIL_HEADER, "accounts.google.com:".parse().unwrap());

        assert_eq!(
            extract_authenticated_email(&headers),
            Err(HeaderError::Empty)
        );
    }

    #[test]
    fn missing_header() {
        let headers = HeaderMap::new();
        assert_eq!(
            extract_authenticated_email(&headers),
            Err(HeaderError::Missing)
        );
    }

    #[test]
    fn value_without_at_sign() {
        let mut headers = HeaderMap::new();
        headers.insert(
            IAP_EMAIL_HEADER,
            "accounts.google.com:1234567890".parse().unwrap(),
        );

        assert_eq!(
            extract_authenticated_email(&headers),
            Err(HeaderError::InvalidFormat)
        );
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            HeaderError::Missing.to_string(),
            "Identity header not provided"
        );
        assert_eq!(HeaderError::Empty.to_string(), "Identity header is empty");
    }
}
