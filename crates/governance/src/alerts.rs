//! Deduplicated alert fan-out.
//!
//! One alert per `(type, agent, session)` key per TTL window; everything else
//! is dropped. Delivery is fire-and-forget: each sender runs in its own task
//! and failures are logged, never propagated to the governed action.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use agent_warden_core::config::AlertsConfig;
use agent_warden_core::traits::AlertSender;
use agent_warden_core::types::Alert;
use agent_warden_core::{Error, Result};

const DEDUP_TTL: Duration = Duration::from_secs(5 * 60);

/// Deduplicating fan-out to every configured sink.
pub struct AlertManager {
    senders: Vec<Arc<dyn AlertSender>>,
    dedup: Mutex<HashMap<String, Instant>>,
    dedup_ttl: Duration,
}

impl AlertManager {
    pub fn new(senders: Vec<Arc<dyn AlertSender>>) -> Self {
        Self {
            senders,
            dedup: Mutex::new(HashMap::new()),
            dedup_ttl: DEDUP_TTL,
        }
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    /// Build senders from the alerts config section; unset sinks are skipped.
    pub fn from_config(config: &AlertsConfig) -> Self {
        let mut senders: Vec<Arc<dyn AlertSender>> = Vec::new();
        if !config.slack.webhook_url.is_empty() {
            senders.push(Arc::new(SlackSender::new(
                &config.slack.webhook_url,
                &config.slack.channel,
            )));
        }
        if !config.webhook.url.is_empty() {
            senders.push(Arc::new(WebhookSender::new(
                &config.webhook.url,
                &config.webhook.secret,
            )));
        }
        Self::new(senders)
    }

    /// Stamp, dedup, and fan out. Returns whether the alert was dispatched
    /// (false means it was collapsed into an earlier one).
    pub fn send(&self, mut alert: Alert) -> bool {
        alert.timestamp = chrono::Utc::now();
        let key = alert.dedup_key();

        {
            let mut dedup = self.dedup.lock().unwrap();
            if let Some(last) = dedup.get(&key) {
                if last.elapsed() < self.dedup_ttl {
                    tracing::debug!(key = %key, "alert deduplicated");
                    return false;
                }
            }
            dedup.insert(key, Instant::now());
        }

        tracing::info!(
            kind = %alert.kind,
            severity = %alert.severity,
            session_id = %alert.session_id,
            "dispatching alert"
        );
        for sender in &self.senders {
            let sender = sender.clone();
            let alert = alert.clone();
            tokio::spawn(async move {
                if let Err(e) = sender.send(&alert).await {
                    tracing::warn!(sender = sender.name(), error = %e, "alert delivery failed");
                }
            });
        }
        true
    }

    /// Drop dedup entries older than twice the TTL.
    pub fn prune_dedup(&self) {
        let horizon = self.dedup_ttl * 2;
        self.dedup
            .lock()
            .unwrap()
            .retain(|_, last| last.elapsed() <= horizon);
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.lock().unwrap().len()
    }
}

// =============================================================================
// Senders
// =============================================================================

/// Slack incoming-webhook sink.
pub struct SlackSender {
    webhook_url: String,
    channel: String,
    client: reqwest::Client,
}

impl SlackSender {
    pub fn new(webhook_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            channel: channel.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertSender for SlackSender {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let mut payload = serde_json::json!({
            "text": format!("*[{}]* {}: {}", alert.severity, alert.kind, alert.message),
        });
        if !self.channel.is_empty() {
            payload["channel"] = serde_json::Value::String(self.channel.clone());
        }
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::internal(format!("slack send: {e}")))?
            .error_for_status()
            .map_err(|e| Error::internal(format!("slack response: {e}")))?;
        Ok(())
    }
}

/// Generic webhook sink with optional HMAC signing.
pub struct WebhookSender {
    url: String,
    secret: String,
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: secret.into(),
            client: reqwest::Client::new(),
        }
    }

    /// `hex(HMAC-SHA256(secret, body))`.
    pub fn signature(secret: &str, body: &[u8]) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| Error::internal(format!("hmac key: {e}")))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl AlertSender for WebhookSender {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let body = serde_json::to_vec(alert)?;
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("User-Agent", "AgentWarden/1.0");
        if !self.secret.is_empty() {
            request = request.header(
                "X-AgentWarden-Signature",
                Self::signature(&self.secret, &body)?,
            );
        }
        request
            .body(body)
            .send()
            .await
            .map_err(|e| Error::internal(format!("webhook send: {e}")))?
            .error_for_status()
            .map_err(|e| Error::internal(format!("webhook response: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_warden_core::types::AlertSeverity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSender {
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AlertSender for CountingSender {
        fn name(&self) -> &str {
            "counting"
        }

        async fn send(&self, _alert: &Alert) -> Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager_with_counter() -> (AlertManager, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let manager = AlertManager::new(vec![Arc::new(CountingSender { hits: hits.clone() })]);
        (manager, hits)
    }

    fn alert(kind: &str, session: &str) -> Alert {
        Alert::new(kind, AlertSeverity::Warning, "test alert")
            .with_agent("agent-1")
            .with_session(session)
    }

    #[tokio::test]
    async fn identical_alerts_collapse_within_ttl() {
        let (manager, hits) = manager_with_counter();
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.send(alert("loop_detected", "s-1"));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_all_fire() {
        let (manager, hits) = manager_with_counter();
        for i in 0..10 {
            manager.send(alert("loop_detected", &format!("s-{i}")));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn key_rearms_after_ttl() {
        let (manager, hits) = manager_with_counter();
        let manager = manager.with_dedup_ttl(Duration::from_millis(30));

        assert!(manager.send(alert("cost_spike", "s-1")));
        assert!(!manager.send(alert("cost_spike", "s-1")));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(manager.send(alert("cost_spike", "s-1")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn prune_drops_only_stale_entries() {
        let (manager, _hits) = manager_with_counter();
        let manager = manager.with_dedup_ttl(Duration::from_millis(10));

        manager.send(alert("old", "s-1"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.send(alert("fresh", "s-1"));

        manager.prune_dedup();
        assert_eq!(manager.dedup_len(), 1);
    }

    #[test]
    fn signature_is_stable_hex_hmac() {
        let sig = WebhookSender::signature("secret", b"{\"a\":1}").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        // Same inputs, same signature.
        assert_eq!(sig, WebhookSender::signature("secret", b"{\"a\":1}").unwrap());
        // Different key, different signature.
        assert_ne!(sig, WebhookSender::signature("other", b"{\"a\":1}").unwrap());
    }

    #[tokio::test]
    async fn sender_failures_do_not_propagate() {
        struct FailingSender;

        #[async_trait]
        impl AlertSender for FailingSender {
            fn name(&self) -> &str {
                "failing"
            }
            async fn send(&self, _alert: &Alert) -> Result<()> {
                Err(Error::internal("sink down"))
            }
        }

        let manager = AlertManager::new(vec![Arc::new(FailingSender)]);
        // Dispatch succeeds even though delivery will fail in the background.
        assert!(manager.send(alert("loop_detected", "s-1")));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
