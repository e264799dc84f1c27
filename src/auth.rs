use std::fs;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use futures::future::{BoxFuture, FutureExt};
use rspotify::{AuthCodePkceSpotify, Config, Credentials, OAuth, prelude::*};

pub const SCOPES: &str =
    "user-read-playback-state user-modify-playback-state user-read-currently-playing";

/// Durable storage for the single opaque credential.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Option<String>;
    fn save(&self, token: &str) -> Result<()>;
    fn delete(&self) -> Result<()>;
}

/// Token kept in a plain file under the cache directory.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Option<String> {
        let token = fs::read_to_string(&self.path).ok()?;
        let token = token.trim();
        (!token.is_empty()).then(|| token.to_string())
    }

    fn save(&self, token: &str) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(&self.path, token)?;
        tracing::debug!(path = %self.path.display(), "Saved token to disk");
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// External authorization handshake.
///
/// `begin` starts the flow; the result comes back later as a redirect payload
/// handed to `complete`.
pub trait AuthHandshake: Send {
    /// Whether the provider can be reached at all.
    fn is_available(&self) -> bool;

    fn begin(&mut self) -> Result<()>;

    /// Returns `None` when the payload is not a response to the flow that
    /// `begin` started. Otherwise the future resolves to the new credential.
    fn complete(&mut self, payload: &str) -> Option<BoxFuture<'static, Result<String>>>;
}

/// Authorization code flow with PKCE against the Spotify accounts service.
pub struct PkceHandshake {
    client_id: String,
    redirect_uri: String,
    client: Option<AuthCodePkceSpotify>,
}

impl PkceHandshake {
    pub fn new(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            client: None,
        }
    }
}

impl AuthHandshake for PkceHandshake {
    fn is_available(&self) -> bool {
        !self.client_id.is_empty()
    }

    fn begin(&mut self) -> Result<()> {
        tracing::info!("Starting browser-based OAuth flow");
        let oauth = OAuth {
            redirect_uri: self.redirect_uri.clone(),
            scopes: SCOPES.split_whitespace().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let mut client = AuthCodePkceSpotify::with_config(
            Credentials::new_pkce(&self.client_id),
            oauth,
            Config {
                token_cached: false,
                token_refreshing: false,
                ..Default::default()
            },
        );

        let url = client.get_authorize_url(None)?;
        if let Err(e) = webbrowser::open(&url) {
            tracing::warn!(error = %e, "Could not open browser");
        }
        tracing::info!(%url, "Authorize in the browser, then pass the redirect URL back");
        self.client = Some(client);
        Ok(())
    }

    fn complete(&mut self, payload: &str) -> Option<BoxFuture<'static, Result<String>>> {
        let code = self.client.as_ref()?.parse_response_code(payload)?;
        let client = self.client.take()?;

        Some(
            async move {
                client.request_token(&code).await?;
                let token = client
                    .token
                    .lock()
                    .await
                    .map_err(|_| anyhow!("token lock poisoned"))?
                    .as_ref()
                    .map(|t| t.access_token.clone())
                    .ok_or_else(|| anyhow!("authorization returned no token"))?;
                tracing::info!("Browser authentication completed successfully");
                Ok(token)
            }
            .boxed(),
        )
    }
}
