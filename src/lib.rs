// Envelope encryption under a key-encryption key
pub mod envelope;

// Refresh-token enrollment and access-token retrieval
pub mod credentials;

// Identity-Aware Proxy assertion verification
pub mod iap;

// OAuth authorization-code flow (PKCE, state, token endpoint)
pub mod oauth;

// Session storage with user-scoped state
pub mod session;

// Request identity headers
pub mod auth;

// Agent profile tool
pub mod profile;

// HTTP API
pub mod api;

// Configuration
pub mod config;

// Secret lookup
pub mod secrets;

// Google Cloud access tokens
pub mod gcp;
