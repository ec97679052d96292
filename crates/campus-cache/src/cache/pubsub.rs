//! Redis Pub/Sub listener for cross-instance invalidation.
//!
//! ```text
//! Instance 1: cache.invalidate_pattern("user:1:*")
//!   ↓
//! Redis: PUBLISH cache:invalidate {"origin":..,"target":{"kind":"pattern",..}}
//!   ↓
//! Instance 2: listener → MultiTierCache::apply_invalidation → local tier cleared
//! Instance 1: ignores its own message
//! ```

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::coordinator::MultiTierCache;
use super::invalidation::InvalidationMessage;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Applies invalidations published by other instances to the local tier.
pub struct InvalidationListener {
    pub redis_url: String,
    pub channel: String,
    pub cache: Arc<MultiTierCache>,
}

impl InvalidationListener {
    /// Spawn the listener. It reconnects with exponential backoff until `true`
    /// is sent on (or the caller drops) the returned sender.
    pub fn start(self) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;

            loop {
                let outcome = tokio::select! {
                    result = self.run() => result,
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                match outcome {
                    // Subscribed at least once; start the next reconnect cycle fresh.
                    Ok(()) => backoff = INITIAL_BACKOFF,
                    Err(e) => {
                        tracing::error!(
                            channel = %self.channel,
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "invalidation listener error, reconnecting"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                        }
                        backoff = next_backoff(backoff);
                    }
                }
            }

            tracing::info!(channel = %self.channel, "invalidation listener stopped");
        });

        shutdown_tx
    }

    /// One subscription. Returns `Ok` when the stream ends after a successful
    /// subscribe, `Err` when subscribing fails.
    async fn run(&self) -> Result<(), String> {
        let client = redis::Client::open(self.redis_url.clone())
            .map_err(|e| format!("failed to create Redis client: {e}"))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| format!("failed to get pub/sub connection: {e}"))?;

        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| format!("failed to subscribe: {e}"))?;

        tracing::info!(channel = %self.channel, "subscribed to invalidation channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read invalidation payload");
                    continue;
                }
            };
            self.handle_payload(&payload);
        }

        tracing::warn!(channel = %self.channel, "pub/sub connection closed");
        Ok(())
    }

    fn handle_payload(&self, payload: &str) {
        let message = match InvalidationMessage::from_json(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed invalidation message");
                return;
            }
        };
        if let Err(e) = self.cache.apply_invalidation(&message) {
            tracing::warn!(error = %e, target = ?message.target, "failed to apply invalidation");
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::coordinator::SetOptions;
    use crate::cache::local::LocalTierStore;
    use crate::cache::policy::TierPolicy;
    use uuid::Uuid;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        assert_eq!(next_backoff(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(200)), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_payload_handling() {
        let cache = Arc::new(
            MultiTierCache::new(
                Arc::new(LocalTierStore::with_capacity(10, 1024)),
                TierPolicy::new(1024, 0.9),
                Duration::from_secs(60),
            )
            .with_invalidation_broadcast("cache:invalidate", Uuid::new_v4()),
        );
        for key in ["user:1:profile", "user:1:settings", "user:2:profile"] {
            cache
                .set(key, &"x".to_string(), SetOptions::default())
                .await
                .unwrap();
        }

        let listener = InvalidationListener {
            redis_url: "redis://127.0.0.1:6379".into(),
            channel: "cache:invalidate".into(),
            cache: Arc::clone(&cache),
        };

        listener.handle_payload("not json");
        assert_eq!(cache.local().len(), 3);

        let remote = InvalidationMessage::pattern(Uuid::new_v4(), "user:1:*");
        listener.handle_payload(&remote.to_json().unwrap());
        assert_eq!(cache.local().len(), 1);
        assert!(cache.local().get("user:2:profile").is_some());
    }
}
