//! The `Authenticator` seam (`spec.md` §1/§9): out of scope to
//! implement concretely (basic/bearer/API key/OAuth2/mTLS/Vault are
//! external collaborators), but the engine needs a trait boundary to
//! call through. Token caches belong to the `Authenticator`, never to
//! the core.

use async_trait::async_trait;

/// One fully-formed outbound request before dispatch, as seen by the
/// authenticator. Mutated in place (headers/params injected).
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query_params: Vec<(String, String)>,
}

/// Pluggable credential injector. Implementations may perform network
/// calls (token acquisition) and cache the result themselves.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &mut OutboundRequest) -> Result<(), AuthError>;

    /// Called when the fetcher observes a 401, giving the
    /// authenticator a chance to force a token refresh before retry.
    async fn on_unauthorized(&self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication failed: {0}")]
    Failed(String),
}

/// Default no-op authenticator: injects nothing. Used when an
/// endpoint declares no `auth_ref`.
#[derive(Debug, Default)]
pub struct NoopAuthenticator;

#[async_trait]
impl Authenticator for NoopAuthenticator {
    async fn authenticate(&self, _request: &mut OutboundRequest) -> Result<(), AuthError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_authenticator_is_a_pass_through() {
        let auth = NoopAuthenticator;
        let mut req = OutboundRequest {
            url: "https://example.com".into(),
            headers: vec![],
            query_params: vec![],
        };
        auth.authenticate(&mut req).await.unwrap();
        assert!(req.headers.is_empty());
    }
}
