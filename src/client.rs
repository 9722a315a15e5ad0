// ============================================================================
// STREAM CLIENT
// ============================================================================
// Reconnecting consumer of the `/ws/metrics` stream.
// ============================================================================

use std::time::Duration;

use futures::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::types::StreamEvent;
use crate::{RECONNECT_INITIAL_DELAY_SECS, RECONNECT_MAX_DELAY_SECS};

/// Exponential reconnect delay: starts at `initial`, doubles per failed
/// attempt, never exceeds `max`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Back to the initial delay after a successful connection
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(RECONNECT_INITIAL_DELAY_SECS),
            Duration::from_secs(RECONNECT_MAX_DELAY_SECS),
        )
    }
}

pub struct StreamClient {
    url: String,
    backoff: ReconnectBackoff,
}

impl StreamClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            backoff: ReconnectBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver decoded events to `on_event`, reconnecting until `token` is cancelled.
    pub async fn run<F>(mut self, token: CancellationToken, mut on_event: F)
    where
        F: FnMut(StreamEvent) + Send,
    {
        loop {
            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = self.session(&mut on_event) => result,
            };
            if let Err(e) = result {
                warn!(target: "pulse::client", url = %self.url, error = %e, "Stream connection lost");
            }

            let delay = self.backoff.next_delay();
            debug!(target: "pulse::client", delay = ?delay, "Reconnecting");
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(target: "pulse::client", url = %self.url, "Stream client stopped");
    }

    /// One connection, read until the server closes it
    async fn session<F>(&mut self, on_event: &mut F) -> TransportResult<()>
    where
        F: FnMut(StreamEvent) + Send,
    {
        let (mut stream, _) =
            connect_async(self.url.as_str())
                .await
                .map_err(|e| TransportError::ConnectionFailed {
                    url: self.url.clone(),
                    message: e.to_string(),
                })?;
        self.backoff.reset();
        info!(target: "pulse::client", url = %self.url, "Connected to metric stream");

        while let Some(message) = stream.next().await {
            let message = message.map_err(|e| TransportError::Protocol {
                message: e.to_string(),
            })?;
            match message {
                Message::Text(text) => match serde_json::from_str::<StreamEvent>(&text) {
                    Ok(event) => on_event(event),
                    Err(e) => {
                        warn!(target: "pulse::client", error = %e, "Skipping undecodable event")
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(TransportError::Disconnected {
            subscriber: self.url.clone(),
        })
    }
}
