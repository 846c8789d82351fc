use crate::config::GraphSettings;
use crate::error::MailError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use yup_oauth2::authenticator::DefaultAuthenticator;
use yup_oauth2::authenticator_delegate::InstalledFlowDelegate;
use yup_oauth2::storage::{TokenInfo, TokenStorage};
use yup_oauth2::{ApplicationSecret, InstalledFlowAuthenticator, InstalledFlowReturnMethod};

const APP_NAME: &str = "otui";
const TOKEN_KEY: &str = "graph_token";

pub const SCOPES: &[&str] = &[
    "https://graph.microsoft.com/Mail.ReadWrite",
    "https://graph.microsoft.com/Mail.Send",
    "https://graph.microsoft.com/User.Read",
    "offline_access",
];

/// Supplies bearer tokens to the gateway.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns a valid token or `MailError::AuthRequired`.
    async fn acquire_token(&self) -> Result<String, MailError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenData {
    tokens: Vec<TokenInfo>,
}

/// Persists the refresh token in the OS keyring.
pub struct RingStorage;

#[async_trait]
impl TokenStorage for RingStorage {
    async fn set(&self, _scopes: &[&str], token: TokenInfo) -> anyhow::Result<()> {
        let entry =
            Entry::new(APP_NAME, TOKEN_KEY).map_err(|e| anyhow::anyhow!("Keyring error: {}", e))?;

        let data = TokenData {
            tokens: vec![token],
        };
        let serialized = serde_json::to_string(&data).context("Failed to serialize tokens")?;

        entry
            .set_password(&serialized)
            .map_err(|e| anyhow::anyhow!("Keyring error: {}", e))?;

        Ok(())
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        self.get_all()
            .await
            .ok()
            .and_then(|data| data.tokens.into_iter().next())
    }
}

impl RingStorage {
    async fn get_all(&self) -> Result<TokenData> {
        let entry =
            Entry::new(APP_NAME, TOKEN_KEY).map_err(|e| anyhow::anyhow!("Keyring error: {}", e))?;

        match entry.get_password() {
            Ok(serialized) => {
                serde_json::from_str(&serialized).context("Failed to deserialize tokens")
            }
            Err(keyring::Error::NoEntry) => Ok(TokenData::default()),
            Err(e) => Err(anyhow::anyhow!("Keyring error: {}", e)),
        }
    }

    pub async fn clear_token(&self) -> Result<()> {
        let entry =
            Entry::new(APP_NAME, TOKEN_KEY).map_err(|e| anyhow::anyhow!("Keyring error: {}", e))?;
        match entry.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Keyring error: {}", e)),
        }
    }
}

/// Hands the sign-in URL to the UI and opens the browser.
pub struct TuiDelegate {
    pub tx: mpsc::Sender<String>,
}

impl InstalledFlowDelegate for TuiDelegate {
    fn present_user_url<'a>(
        &'a self,
        url: &'a str,
        _need_code: bool,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<String, String>> + Send + 'a>> {
        Box::pin(async move {
            let _ = self.tx.send(url.to_string()).await;
            if let Err(e) = open::that(url) {
                tracing::debug!("could not open browser: {}", e);
            }
            // The redirect flow captures the code itself.
            Ok(String::new())
        })
    }
}

/// Microsoft identity platform endpoints for a public client.
pub fn application_secret(settings: &GraphSettings) -> ApplicationSecret {
    let base = format!(
        "https://login.microsoftonline.com/{}/oauth2/v2.0",
        settings.tenant
    );
    ApplicationSecret {
        client_id: settings.client_id.clone(),
        auth_uri: format!("{}/authorize", base),
        token_uri: format!("{}/token", base),
        redirect_uris: vec!["http://localhost".to_string()],
        ..Default::default()
    }
}

/// yup-oauth2 backed provider. `token()` serves the cached token, renews it
/// silently with the refresh token, and only then falls back to the
/// interactive browser flow.
#[derive(Clone)]
pub struct Authenticator {
    inner: DefaultAuthenticator,
}

impl Authenticator {
    pub async fn build(settings: &GraphSettings, delegate: TuiDelegate) -> Result<Self> {
        if settings.client_id.trim().is_empty() {
            anyhow::bail!("graph.client_id is not set in settings.toml");
        }
        let inner = InstalledFlowAuthenticator::builder(
            application_secret(settings),
            InstalledFlowReturnMethod::HTTPRedirect,
        )
        .with_storage(Box::new(RingStorage))
        .flow_delegate(Box::new(delegate))
        .build()
        .await
        .context("Failed to build authenticator")?;

        Ok(Self { inner })
    }
}

#[async_trait]
impl CredentialProvider for Authenticator {
    async fn acquire_token(&self) -> Result<String, MailError> {
        let token = self
            .inner
            .token(SCOPES)
            .await
            .map_err(|e| MailError::AuthRequired(e.to_string()))?;
        token
            .token()
            .map(str::to_string)
            .ok_or_else(|| MailError::AuthRequired("token response had no access token".into()))
    }
}
