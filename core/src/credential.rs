// Credential: where the client gets its access URL
//
// The access URL embeds a short-lived token issued by the service. It is
// fetched on every fresh connect; recovery reuses the last one.

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Credential error: {0}")]
pub struct CredentialError(pub String);

/// Issues client access URLs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClientCredential: Send + Sync + 'static {
    async fn client_access_url(&self) -> Result<String, CredentialError>;
}

/// A fixed URL, e.g. one copied from the portal
#[derive(Debug, Clone)]
pub struct StaticUrlCredential {
    url: String,
}

impl StaticUrlCredential {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl ClientCredential for StaticUrlCredential {
    async fn client_access_url(&self) -> Result<String, CredentialError> {
        Ok(self.url.clone())
    }
}

/// URLs produced by an async closure, typically a call to the app server
pub struct UrlProviderCredential<F> {
    provider: F,
}

impl<F> UrlProviderCredential<F>
where
    F: Fn() -> BoxFuture<'static, Result<String, CredentialError>> + Send + Sync + 'static,
{
    pub fn new(provider: F) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<F> ClientCredential for UrlProviderCredential<F>
where
    F: Fn() -> BoxFuture<'static, Result<String, CredentialError>> + Send + Sync + 'static,
{
    async fn client_access_url(&self) -> Result<String, CredentialError> {
        (self.provider)().await
    }
}
