//! Authentication session seam.
//!
//! Credential acquisition and token persistence live outside this crate; the
//! orchestration layer only needs to know whether the session is still good,
//! which headers to attach, and which server to talk to.

/// The authentication session consumed by every orchestration step.
///
/// Implementations are expected to treat expiry as authoritative from the
/// server side; `is_expired` may be backed by a cached answer from an earlier
/// round trip. Providers check it before each call and abort without touching
/// the network when it reports true.
pub trait AuthProvider: Send + Sync {
    /// Whether the session token is no longer usable.
    fn is_expired(&self) -> bool;

    /// Authorization headers for the next request.
    ///
    /// `persist` mirrors the platform convention of refreshing the stored
    /// token alongside the request; implementations that do not persist
    /// anything can ignore it.
    fn auth_headers(&self, persist: bool) -> Vec<(String, String)>;

    /// Base server URL, without a trailing slash (e.g.
    /// `https://cloud.appscan.com`).
    fn server_url(&self) -> String;
}

/// A minimal bearer-token session.
///
/// Suitable for integrations that obtain a token out of band and for tests.
/// The token is never refreshed; `is_expired` reports whatever was last set.
pub struct BearerAuth {
    server: String,
    token: String,
    expired: std::sync::atomic::AtomicBool,
}

impl BearerAuth {
    /// Create a session for the given server with a fixed bearer token.
    #[must_use]
    pub fn new(server: String, token: String) -> Self {
        let server = server.trim_end_matches('/').to_string();
        Self {
            server,
            token,
            expired: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Mark the session as expired; subsequent provider calls will abort
    /// before reaching the network.
    pub fn mark_expired(&self) {
        self.expired
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

impl AuthProvider for BearerAuth {
    fn is_expired(&self) -> bool {
        self.expired.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn auth_headers(&self, _persist: bool) -> Vec<(String, String)> {
        vec![(
            "Authorization".to_string(),
            format!("Bearer {}", self.token),
        )]
    }

    fn server_url(&self) -> String {
        self.server.clone()
    }
}
