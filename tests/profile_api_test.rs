// Integration tests for GET /api/profile

use agent_auth::api::{create_router, AppState};
use agent_auth::credentials::{CredentialManager, RefreshToken, USER_GOOGLE_STATE_KEY};
use agent_auth::envelope::{EnvelopeCipher, LocalKek};
use agent_auth::iap::{AssertionVerifier, IAP_ISSUER};
use agent_auth::oauth::{OAuthClient, OAuthProviderConfig, StateManager};
use agent_auth::profile::ProfileClient;
use agent_auth::session::{MemorySessionStore, SessionState, SessionStore};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const APP_NAME: &str = "agent";
const AUDIENCE: &str = "/projects/123456/global/backendServices/987654";
const KID: &str = "iap-key-1";
const USER: &str = "u1@example.com";
const OTHER_USER: &str = "u2@example.com";

struct TestApp {
    router: Router,
    sessions: Arc<dyn SessionStore>,
    credentials: Arc<CredentialManager>,
    server: MockServer,
    signing_key: EncodingKey,
}

async fn create_test_app() -> TestApp {
    let server = MockServer::start().await;
    let http = reqwest::Client::new();

    let key_pair = rcgen::KeyPair::generate().unwrap();
    let signing_key = EncodingKey::from_ec_pem(key_pair.serialize_pem().as_bytes()).unwrap();
    let raw = key_pair.public_key_raw();

    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": [{
                "kty": "EC",
                "crv": "P-256",
                "alg": "ES256",
                "use": "sig",
                "kid": KID,
                "x": URL_SAFE_NO_PAD.encode(&raw[1..33]),
                "y": URL_SAFE_NO_PAD.encode(&raw[33..65])
            }]
        })))
        .mount(&server)
        .await;

    let mut provider = OAuthProviderConfig::google("client-1", "secret-1");
    provider.token_url = format!("{}/token", server.uri());
    let oauth = Arc::new(OAuthClient::new(http.clone(), provider));

    let cipher = Arc::new(EnvelopeCipher::new(Arc::new(LocalKek::generate())));
    let credentials = Arc::new(CredentialManager::new(cipher, oauth.clone()));
    let sessions: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());

    let state = AppState {
        app_name: APP_NAME.to_string(),
        redirect_uri: "https://agent.example.com/callback".to_string(),
        iap_audience: AUDIENCE.to_string(),
        iap_issuer: IAP_ISSUER.to_string(),
        oauth,
        state_manager: StateManager::new(600),
        credentials: credentials.clone(),
        sessions: sessions.clone(),
        verifier: Arc::new(AssertionVerifier::with_jwks_url(
            http.clone(),
            format!("{}/jwks", server.uri()),
        )),
        profile_client: ProfileClient::with_url(http, format!("{}/userinfo", server.uri())),
    };

    TestApp {
        router: create_router(state),
        sessions,
        credentials,
        server,
        signing_key,
    }
}

impl TestApp {
    fn assertion_for(&self, email: &str, audience: &str) -> String {
        let now = chrono::Utc::now().timestamp();
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(KID.to_string());
        encode(
            &header,
            &json!({
                "aud": audience,
                "iss": IAP_ISSUER,
                "sub": "accounts.google.com:1234567890",
                "email": email,
                "iat": now,
                "exp": now + 600
            }),
            &self.signing_key,
        )
        .unwrap()
    }

    /// Store `refresh_token` for `user` as the callback would.
    async fn enroll(&self, user: &str, refresh_token: &str) -> String {
        let encrypted = self
            .credentials
            .encrypt_token(&RefreshToken::new(refresh_token), user)
            .await
            .unwrap();
        self.store_envelope(user, encrypted.as_str()).await;
        encrypted.as_str().to_string()
    }

    async fn store_envelope(&self, user: &str, envelope: &str) {
        let mut state = SessionState::new();
        state.insert(USER_GOOGLE_STATE_KEY.to_string(), json!(envelope));
        self.sessions
            .create_session(APP_NAME, user, state)
            .await
            .unwrap();
    }

    async fn request(&self, uri: &str, assertion: Option<&str>, email_header: Option<&str>) -> axum::response::Response {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(assertion) = assertion {
            builder = builder.header("x-goog-iap-jwt-assertion", assertion);
        }
        if let Some(email) = email_header {
            builder = builder.header("x-goog-authenticated-user-email", email);
        }

        self.router
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }
}

async fn mount_refresh(server: &MockServer, refresh_token: &str, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains(format!("refresh_token={}", refresh_token)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-2",
            "expires_in": 3599,
            "token_type": "Bearer"
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

async fn mount_userinfo(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .and(header("authorization", "Bearer access-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "1234567890",
            "email": USER,
            "name": "User One"
        })))
        .mount(server)
        .await;
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Enrolled user gets their profile, with email when asked.
#[tokio::test]
async fn test_profile_with_email() {
    let app = create_test_app().await;
    app.enroll(USER, "refresh-abc").await;
    mount_refresh(&app.server, "refresh-abc", 1).await;
    mount_userinfo(&app.server).await;

    let assertion = app.assertion_for(USER, AUDIENCE);
    let response = app
        .request(
            "/api/profile?include_email=true",
            Some(&assertion),
            Some("accounts.google.com:u1@example.com"),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["user"], USER);
    assert_eq!(
        body["profile"],
        "User profile: Name=User One, Email=u1@example.com"
    );
}

/// Email omitted unless asked; the unsigned header is optional.
#[tokio::test]
async fn test_profile_without_email() {
    let app = create_test_app().await;
    app.enroll(USER, "refresh-abc").await;
    mount_refresh(&app.server, "refresh-abc", 1).await;
    mount_userinfo(&app.server).await;

    let assertion = app.assertion_for(USER, AUDIENCE);
    let response = app.request("/api/profile", Some(&assertion), None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["profile"], "User profile: Name=User One");
}

/// No assertion, no access.
#[tokio::test]
async fn test_profile_without_assertion_returns_401() {
    let app = create_test_app().await;

    let response = app
        .request("/api/profile", None, Some("accounts.google.com:u1@example.com"))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Assertion minted for another backend.
#[tokio::test]
async fn test_profile_wrong_audience_returns_401() {
    let app = create_test_app().await;
    app.enroll(USER, "refresh-abc").await;
    mount_refresh(&app.server, "refresh-abc", 0).await;

    let assertion = app.assertion_for(USER, "/projects/123456/global/backendServices/1");
    let response = app.request("/api/profile", Some(&assertion), None).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// The unsigned email header must agree with the verified assertion.
#[tokio::test]
async fn test_profile_header_mismatch_returns_401() {
    let app = create_test_app().await;
    app.enroll(USER, "refresh-abc").await;
    mount_refresh(&app.server, "refresh-abc", 0).await;

    let assertion = app.assertion_for(USER, AUDIENCE);
    let response = app
        .request(
            "/api/profile",
            Some(&assertion),
            Some("accounts.google.com:u2@example.com"),
        )
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Authenticated user who never enrolled.
#[tokio::test]
async fn test_profile_not_enrolled_returns_401() {
    let app = create_test_app().await;

    let assertion = app.assertion_for(USER, AUDIENCE);
    let response = app.request("/api/profile", Some(&assertion), None).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error"], "not authenticated");
}

/// A revoked token looks exactly like a missing one.
#[tokio::test]
async fn test_profile_revoked_token_returns_401() {
    let app = create_test_app().await;
    app.enroll(USER, "refresh-revoked").await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        })))
        .expect(1)
        .mount(&app.server)
        .await;

    let assertion = app.assertion_for(USER, AUDIENCE);
    let response = app.request("/api/profile", Some(&assertion), None).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error"], "not authenticated");
}

/// An envelope copied into another user's state does not open for them,
/// and the provider is never asked.
#[tokio::test]
async fn test_profile_envelope_of_other_user_is_rejected() {
    let app = create_test_app().await;
    let envelope = app.enroll(USER, "refresh-abc").await;
    app.store_envelope(OTHER_USER, &envelope).await;
    mount_refresh(&app.server, "refresh-abc", 0).await;

    let assertion = app.assertion_for(OTHER_USER, AUDIENCE);
    let response = app.request("/api/profile", Some(&assertion), None).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error"], "not authenticated");
}

/// Userinfo down after a successful refresh.
#[tokio::test]
async fn test_profile_userinfo_failure_returns_502() {
    let app = create_test_app().await;
    app.enroll(USER, "refresh-abc").await;
    mount_refresh(&app.server, "refresh-abc", 1).await;
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&app.server)
        .await;

    let assertion = app.assertion_for(USER, AUDIENCE);
    let response = app.request("/api/profile", Some(&assertion), None).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}
