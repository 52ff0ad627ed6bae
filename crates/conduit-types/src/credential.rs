//! Credential collaborator used by the chat client.

use crate::ApiError;
use std::future::Future;
use std::pin::Pin;

/// A credential in the form the HTTP layer should present it.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Sent as the `x-api-key` header.
    ApiKey(String),
    /// Sent as `Authorization: Bearer <token>`.
    Bearer(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::ApiKey(_) => f.write_str("ApiKey(***)"),
            Credential::Bearer(_) => f.write_str("Bearer(***)"),
        }
    }
}

/// Source of the current credential.
///
/// Acquisition, refresh and storage belong to the implementor; the chat
/// client asks once per request. Dyn-compatible so clients can hold
/// `Arc<dyn CredentialProvider>`.
pub trait CredentialProvider: Send + Sync {
    fn current_credential(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Credential, ApiError>> + Send + '_>>;
}

/// A credential that never changes.
#[derive(Debug, Clone)]
pub struct StaticCredential(Credential);

impl StaticCredential {
    pub fn new(credential: Credential) -> Self {
        Self(credential)
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Self(Credential::ApiKey(key.into()))
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self(Credential::Bearer(token.into()))
    }
}

impl CredentialProvider for StaticCredential {
    fn current_credential(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Credential, ApiError>> + Send + '_>> {
        let credential = self.0.clone();
        Box::pin(async move { Ok(credential) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn provider_is_dyn_compatible() {
        fn _accept(_p: &dyn CredentialProvider) {}
        fn _assert_send_sync<T: Send + Sync>() {}
        _assert_send_sync::<Arc<dyn CredentialProvider>>();
    }

    #[test]
    fn debug_hides_secret() {
        let shown = format!("{:?}", Credential::ApiKey("sk-secret".into()));
        assert!(!shown.contains("sk-secret"));
    }

    #[tokio::test]
    async fn static_credential_returns_same_value() {
        let provider = StaticCredential::bearer("tok");
        let first = provider.current_credential().await.unwrap();
        let second = provider.current_credential().await.unwrap();
        assert_eq!(first, Credential::Bearer("tok".into()));
        assert_eq!(first, second);
    }
}
