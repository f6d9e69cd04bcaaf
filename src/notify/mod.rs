use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;

pub mod model;

pub use model::{AlertOptions, AlertPayload};

/// Platform-level alert channel (desktop/phone push).
#[async_trait]
pub trait PlatformNotifier: Send + Sync {
    async fn send(&self, title: &str, options: &AlertOptions) -> Result<()>;
}

/// Posts alerts as JSON to a push webhook.
#[derive(Clone)]
pub struct WebhookNotifier {
    http: Client,
    url: Url,
}

impl fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookNotifier")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl WebhookNotifier {
    pub fn new(url: Url) -> Result<Self> {
        let http = Client::builder()
            .user_agent("dose-buddy/0.1")
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, url })
    }

    pub fn build_request(&self, title: &str, options: &AlertOptions) -> Result<reqwest::Request> {
        let payload = AlertPayload {
            title: title.to_string(),
            body: options.body.clone(),
            icon: options.icon.clone(),
        };
        self.http
            .post(self.url.clone())
            .header("Content-Type", "application/json")
            .json(&payload)
            .build()
            .context("failed to build alert request")
    }
}

#[async_trait]
impl PlatformNotifier for WebhookNotifier {
    async fn send(&self, title: &str, options: &AlertOptions) -> Result<()> {
        let request = self.build_request(title, options)?;
        debug!(url = %request.url(), title, "posting alert");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach alert webhook")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(%status, body = %body, "alert webhook rejected request");
            return Err(anyhow!("alert webhook error {}: {}", status, body));
        }
        Ok(())
    }
}

/// Writes alerts to the log. Used when no webhook is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl PlatformNotifier for LogNotifier {
    async fn send(&self, title: &str, options: &AlertOptions) -> Result<()> {
        info!(title, body = %options.body, "alert");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    Default,
    Granted,
    Denied,
}

/// Permission check in front of a [`PlatformNotifier`]. Sending without a
/// grant is a silent no-op.
#[derive(Clone)]
pub struct PermissionGate {
    notifier: Arc<dyn PlatformNotifier>,
    permission: Arc<RwLock<Permission>>,
}

impl fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionGate").finish_non_exhaustive()
    }
}

impl PermissionGate {
    pub fn new(notifier: Arc<dyn PlatformNotifier>, permission: Permission) -> Self {
        Self {
            notifier,
            permission: Arc::new(RwLock::new(permission)),
        }
    }

    /// Build the gate described by the `notifications` config section.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let notifier: Arc<dyn PlatformNotifier> = match cfg.notifications.webhook_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {
                let url = Url::parse(url).context("invalid notifications.webhook_url")?;
                Arc::new(WebhookNotifier::new(url)?)
            }
            _ => Arc::new(LogNotifier),
        };
        Ok(Self::new(notifier, cfg.notifications.permission))
    }

    pub async fn permission(&self) -> Permission {
        *self.permission.read().await
    }

    /// One-time prompt: an undecided permission becomes granted; an explicit
    /// denial sticks.
    pub async fn request_permission(&self) -> Permission {
        let mut guard = self.permission.write().await;
        if *guard == Permission::Default {
            *guard = Permission::Granted;
        }
        *guard
    }

    /// Send when granted. Returns whether the notifier was called.
    pub async fn send(&self, title: &str, options: &AlertOptions) -> Result<bool> {
        if self.permission().await != Permission::Granted {
            debug!(title, "alert skipped: permission not granted");
            return Ok(false);
        }
        self.notifier.send(title, options).await?;
        Ok(true)
    }
}
