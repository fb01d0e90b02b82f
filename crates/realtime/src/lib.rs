use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use thiserror::Error;
use tokio::sync::broadcast;

/// Shared channel every connected client watches for feed changes.
pub const FEED_CHANNEL: &str = "messages";

/// Derives the per-recipient notification channel from an identity.
///
/// The name is an opaque base64 encoding of the full identity, so dots,
/// at-signs, and plus-addressing in the local part can neither corrupt the
/// name nor make two identities collide.
pub fn user_channel(identity: &str) -> String {
    format!("user.{}", URL_SAFE_NO_PAD.encode(identity.as_bytes()))
}

/// A payload-free signal: receivers re-fetch full state from the store
/// instead of reading anything off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub channel: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("channel name must be non-empty")]
    EmptyChannel,
}

/// Fan-out bus for named channels. Publish is fire-and-forget and
/// best-effort: publishing with no subscribers succeeds, and slow
/// subscribers may drop signals (they recover by re-fetching on the next
/// one). Cloning shares the underlying bus.
#[derive(Clone)]
pub struct SignalHub {
    tx: broadcast::Sender<Signal>,
}

impl SignalHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, channel: &str) -> Result<(), PublishError> {
        if channel.is_empty() {
            return Err(PublishError::EmptyChannel);
        }
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(Signal {
            channel: channel.to_string(),
        });
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }
}
