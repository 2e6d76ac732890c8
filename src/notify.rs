use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use crate::config::BarkConfig;
use crate::error::NotifyError;

/// Best-effort delivery of a human-readable message.
pub trait Notify {
    /// Never fails; problems are logged.
    fn notify(&self, message: &str) -> impl Future<Output = ()> + Send;
}

/// Push notifications through a Bark-style GET endpoint.
///
/// The configured URL carries one `%s` placeholder which receives the
/// URL-encoded message, e.g. `https://api.day.app/<key>/%s`.
#[derive(Debug, Clone)]
pub struct BarkNotifier {
    url_template: String,
    client: Client,
}

impl BarkNotifier {
    pub fn new(config: &BarkConfig) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            url_template: config.api_url.clone(),
            client,
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.url_template.is_empty()
    }

    fn build_url(&self, message: &str) -> String {
        self.url_template.replacen("%s", &urlencoding::encode(message), 1)
    }

    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        let url = self.build_url(message);
        debug!(url = %url, "Sending notification");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

impl Notify for BarkNotifier {
    async fn notify(&self, message: &str) {
        if !self.is_enabled() {
            return;
        }
        if let Err(e) = self.send(message).await {
            warn!("Failed to send notification: {}", e);
        }
    }
}

#[cfg(test)]
pub mod recording {
    use std::sync::{Arc, Mutex};

    use super::Notify;

    /// Keeps every message instead of sending it.
    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        pub messages: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingNotifier {
        pub fn sent(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl Notify for RecordingNotifier {
        async fn notify(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }
}
