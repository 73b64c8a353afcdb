//! The delivery capability the campaign runner drives.
//!
//! All knowledge of the platform's web UI (finding the message box, clicking
//! through fallbacks) lives behind [`DeliverySession::send`]. The shipped
//! implementation talks to a browser-automation sidecar over HTTP and hands
//! it the saved session cookies.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, SetupError};
use crate::handle::ProfileHandle;

#[async_trait]
pub trait Deliverer: Send + Sync {
    /// Open an authenticated session. Fails before any message is attempted.
    async fn open(&self) -> Result<Box<dyn DeliverySession>, SetupError>;
}

#[async_trait]
pub trait DeliverySession: Send {
    /// One delivery attempt. `Ok(false)` means the platform did not confirm.
    async fn send(&mut self, handle: &ProfileHandle, message: &str)
    -> Result<bool, DeliveryError>;

    /// Release the session. Called exactly once on every exit path.
    async fn close(&mut self);
}

pub struct RemoteBrowserDeliverer {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    cookies_path: PathBuf,
}

impl RemoteBrowserDeliverer {
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        cookies_path: impl Into<PathBuf>,
    ) -> Result<Self, SetupError> {
        // Sends drive a real browser, so give them room.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            cookies_path: cookies_path.into(),
        })
    }

    fn load_cookies(&self) -> Result<serde_json::Value, SetupError> {
        let raw = std::fs::read_to_string(&self.cookies_path).map_err(|e| {
            SetupError::Cookies(format!("{}: {e}", self.cookies_path.display()))
        })?;
        let cookies: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| SetupError::Cookies(format!("{}: {e}", self.cookies_path.display())))?;
        match cookies.as_array() {
            Some(list) if !list.is_empty() => Ok(cookies),
            _ => Err(SetupError::Cookies(
                "cookie file must hold a non-empty JSON array".to_string(),
            )),
        }
    }
}

#[derive(Deserialize)]
struct OpenedSession {
    session_id: String,
}

#[derive(Deserialize)]
struct SendOutcome {
    delivered: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[async_trait]
impl Deliverer for RemoteBrowserDeliverer {
    async fn open(&self) -> Result<Box<dyn DeliverySession>, SetupError> {
        let cookies = self.load_cookies()?;
        let mut req = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .json(&serde_json::json!({ "cookies": cookies }));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(SetupError::Api {
                status: status.as_u16(),
                message,
            });
        }
        let opened: OpenedSession = resp
            .json()
            .await
            .map_err(|e| SetupError::Init(format!("bad session response: {e}")))?;

        info!(session_id = %opened.session_id, "delivery session opened");
        Ok(Box::new(RemoteSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            session_id: opened.session_id,
            closed: false,
        }))
    }
}

struct RemoteSession {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    session_id: String,
    closed: bool,
}

impl RemoteSession {
    fn endpoint(&self, tail: &str) -> String {
        format!("{}/sessions/{}{}", self.base_url, self.session_id, tail)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl DeliverySession for RemoteSession {
    async fn send(
        &mut self,
        handle: &ProfileHandle,
        message: &str,
    ) -> Result<bool, DeliveryError> {
        let resp = self
            .authed(self.client.post(self.endpoint("/messages")))
            .json(&serde_json::json!({ "handle": handle.as_str(), "message": message }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Api {
                status: status.as_u16(),
                message,
            });
        }
        let outcome: SendOutcome = resp
            .json()
            .await
            .map_err(|e| DeliveryError::Rejected(format!("bad send response: {e}")))?;
        if !outcome.delivered {
            debug!(
                handle = %handle,
                reason = outcome.reason.as_deref().unwrap_or("unspecified"),
                "sidecar did not confirm delivery"
            );
        }
        Ok(outcome.delivered)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match self
            .authed(self.client.delete(self.endpoint("")))
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => {
                info!(session_id = %self.session_id, "delivery session closed")
            }
            Ok(r) => warn!(session_id = %self.session_id, status = %r.status(), "session close rejected"),
            Err(e) => warn!(session_id = %self.session_id, error = %e, "session close failed"),
        }
    }
}
