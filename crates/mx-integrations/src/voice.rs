//! Voice bridge: fire-and-forget announcements to a local speech service.
//!
//! Disabled unless an endpoint is configured; failures are logged and
//! swallowed — nothing in the fabric waits on speech.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::IntegrationError;

#[derive(Debug, Serialize)]
struct SpeakRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
}

pub struct VoiceBridge {
    client: reqwest::Client,
    endpoint: Option<String>,
    voice: Option<String>,
}

impl VoiceBridge {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .expect("reqwest client"),
            endpoint,
            voice: None,
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Speak a line. Errors short of a disabled bridge are logged, not
    /// returned — callers treat speech as best-effort.
    pub async fn speak(&self, text: &str) -> Result<(), IntegrationError> {
        let Some(endpoint) = &self.endpoint else {
            return Err(IntegrationError::Disabled("voice bridge"));
        };
        let request = SpeakRequest {
            text,
            voice: self.voice.as_deref(),
        };
        match self.client.post(endpoint).json(&request).send().await {
            Ok(response) => {
                debug!(status = %response.status(), "voice bridge responded");
            }
            Err(e) => {
                debug!(error = %e, "voice bridge unreachable");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_bridge_refuses() {
        let bridge = VoiceBridge::new(None);
        assert!(!bridge.is_enabled());
        assert!(matches!(
            bridge.speak("hello").await,
            Err(IntegrationError::Disabled(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_swallowed() {
        let bridge = VoiceBridge::new(Some("http://127.0.0.1:9/speak".into()));
        assert!(bridge.is_enabled());
        // Connection refused is logged, not surfaced.
        bridge.speak("hello").await.unwrap();
    }
}
