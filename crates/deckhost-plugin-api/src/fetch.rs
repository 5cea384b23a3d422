//! Package downloads.

use deckhost_core::InstallError;
use futures::future::BoxFuture;

/// Downloads a package archive.
#[cfg_attr(test, mockall::automock)]
pub trait PackageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>, InstallError>>;
}

/// Fetches packages over HTTP(S).
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PackageFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>, InstallError>> {
        let client = self.client.clone();
        let url = url.to_string();

        Box::pin(async move {
            tracing::info!("Downloading package from {}", url);
            let response = client
                .get(&url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| InstallError::Network(e.to_string()))?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| InstallError::Network(e.to_string()))?;
            Ok(bytes.to_vec())
        })
    }
}
