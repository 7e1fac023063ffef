//! 🔒 Credentials: the bouncer's clipboard.
//!
//! Token resolution, secret stores and service-account dances belong to whoever wires the
//! bridge together. The core only needs something that hands out a bearer token and can be
//! asked to freshen it up before a long-running read.

use async_trait::async_trait;
use tracing::trace;

use crate::error::{BridgeError, BridgeResult};

/// 🔑 Something that can authorize warehouse calls.
#[async_trait]
pub trait CredentialProvider: std::fmt::Debug + Send + Sync {
    /// 🎫 The current bearer token.
    async fn access_token(&self) -> BridgeResult<String>;

    /// 🔄 Refresh the token if it has expired (or is about to). A no-op otherwise.
    async fn refresh_if_expired(&self) -> BridgeResult<()>;
}

/// 🪪 A fixed token from config. It never expires, or at least it never admits it.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🙈 tokens do not go in logs. not even debug logs. especially not debug logs.
        f.debug_struct("StaticTokenProvider")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn access_token(&self) -> BridgeResult<String> {
        self.token.clone().ok_or_else(|| {
            BridgeError::Credentials(
                "no access token configured; set warehouse.BigQuery.access_token or WBX_WAREHOUSE".into(),
            )
        })
    }

    async fn refresh_if_expired(&self) -> BridgeResult<()> {
        trace!("🔄 static token asked to refresh; it shrugs");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn the_one_where_the_token_is_handed_over_but_never_printed() {
        let provider = StaticTokenProvider::new(Some("sekrit".into()));
        assert_eq!(provider.access_token().await.unwrap(), "sekrit");
        assert!(provider.refresh_if_expired().await.is_ok());
        assert!(!format!("{provider:?}").contains("sekrit"));
    }

    #[tokio::test]
    async fn the_one_where_no_token_means_no_entry() {
        let provider = StaticTokenProvider::new(None);
        assert!(matches!(
            provider.access_token().await,
            Err(BridgeError::Credentials(_))
        ));
    }
}
