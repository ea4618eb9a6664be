//! Persistence backends for the FernMQTT client runtime.
//!
//! The client core is written against one trait, [`PersistencePort`]: a
//! keyed byte-blob store scoped per client id. Two backends ship here —
//! [`memory::MemoryPersistence`] (no durability, default) and
//! [`sqlite::SqlitePersistence`] (durable, `sqlite` feature) — plus
//! [`HookedPersistence`], which wraps either one with the optional
//! before-write/after-read transforms the client installs via
//! `set_callbacks`.

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Error type for persistence operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("persistence handle not open for client {0}")]
    NotOpen(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Key-namespace tags from the persistence-port key scheme: `<tag>-<seqno>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTag {
    /// Persisted outbound command (MQTT 3.x).
    OutboundCommand,
    /// Persisted outbound command (MQTT 5).
    OutboundCommandV5,
    /// Sent PUBLISH awaiting ack (MQTT 3.x).
    SentPublish,
    /// Sent PUBLISH awaiting ack (MQTT 5).
    SentPublishV5,
    /// Received PUBLISH awaiting PUBREL (MQTT 3.x).
    ReceivedPublish,
    /// Received PUBLISH awaiting PUBREL (MQTT 5).
    ReceivedPublishV5,
    /// PUBREL awaiting PUBCOMP (MQTT 3.x).
    PubRelSent,
    /// PUBREL awaiting PUBCOMP (MQTT 5).
    PubRelSentV5,
    /// Queued inbound message (MQTT 3.x).
    QueuedInbound,
    /// Queued inbound message (MQTT 5).
    QueuedInboundV5,
}

impl KeyTag {
    fn prefix(self) -> &'static str {
        match self {
            KeyTag::OutboundCommand => "o",
            KeyTag::OutboundCommandV5 => "o5",
            KeyTag::SentPublish => "s",
            KeyTag::SentPublishV5 => "s5",
            KeyTag::ReceivedPublish => "r",
            KeyTag::ReceivedPublishV5 => "r5",
            KeyTag::PubRelSent => "c",
            KeyTag::PubRelSentV5 => "c5",
            KeyTag::QueuedInbound => "q",
            KeyTag::QueuedInboundV5 => "q5",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        Some(match prefix {
            "o" => KeyTag::OutboundCommand,
            "o5" => KeyTag::OutboundCommandV5,
            "s" => KeyTag::SentPublish,
            "s5" => KeyTag::SentPublishV5,
            "r" => KeyTag::ReceivedPublish,
            "r5" => KeyTag::ReceivedPublishV5,
            "c" => KeyTag::PubRelSent,
            "c5" => KeyTag::PubRelSentV5,
            "q" => KeyTag::QueuedInbound,
            "q5" => KeyTag::QueuedInboundV5,
            _ => return None,
        })
    }
}

/// Sequence numbers wrap back to 0 at this bound, matching the source's
/// use of a 32-bit counter reserved well below overflow.
pub const SEQNO_WRAP: u32 = u32::MAX - 1;

/// Builds a `<tag>-<seqno>` persistence key.
pub fn make_key(tag: KeyTag, seqno: u32) -> String {
    format!("{}-{seqno}", tag.prefix())
}

/// Splits a `<tag>-<seqno>` key back into its parts, for restore-on-create
/// sorting. Returns `None` for any key not in this namespace (a backend
/// should never hand one back, but a corrupted store must not panic).
pub fn parse_key(key: &str) -> Option<(KeyTag, u32)> {
    let (prefix, seqno) = key.rsplit_once('-')?;
    let tag = KeyTag::from_prefix(prefix)?;
    let seqno: u32 = seqno.parse().ok()?;
    Some((tag, seqno))
}

/// A keyed byte-blob store scoped per client id.
///
/// `open` must be called before any other operation for a given
/// `client_id`; `close` releases backend resources (e.g. the sqlite
/// connection) but does not erase data — that is `clear`'s job.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn open(&self, client_id: &str, server_uri: &str) -> Result<()>;
    async fn put(&self, client_id: &str, key: &str, buffers: &[Bytes]) -> Result<()>;
    async fn get(&self, client_id: &str, key: &str) -> Result<Option<Bytes>>;
    async fn remove(&self, client_id: &str, key: &str) -> Result<()>;
    async fn keys(&self, client_id: &str) -> Result<Vec<String>>;
    async fn clear(&self, client_id: &str) -> Result<()>;
    async fn close(&self, client_id: &str) -> Result<()>;
}

/// Concatenates `put`'s buffer list the way the contract requires before
/// handing it to a backend that only stores one blob per key.
pub(crate) fn concat_buffers(buffers: &[Bytes]) -> Bytes {
    if buffers.len() == 1 {
        return buffers[0].clone();
    }

    let mut out = Vec::with_capacity(buffers.iter().map(|b| b.len()).sum());
    for b in buffers {
        out.extend_from_slice(b);
    }
    Bytes::from(out)
}

type WriteHook = Box<dyn Fn(Vec<Bytes>) -> Vec<Bytes> + Send + Sync>;
type ReadHook = Box<dyn Fn(Bytes) -> Bytes + Send + Sync>;

/// Wraps a [`PersistencePort`] with the optional `before_write`/`after_read`
/// transforms a client installs via `set_callbacks`. The core calls them
/// symmetrically: every `put` passes through `before_write` (if set) before
/// reaching the backend, every `get` passes its result through `after_read`.
pub struct HookedPersistence<P> {
    inner: P,
    before_write: Option<WriteHook>,
    after_read: Option<ReadHook>,
}

impl<P: PersistencePort> HookedPersistence<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            before_write: None,
            after_read: None,
        }
    }

    pub fn with_before_write(
        mut self,
        hook: impl Fn(Vec<Bytes>) -> Vec<Bytes> + Send + Sync + 'static,
    ) -> Self {
        self.before_write = Some(Box::new(hook));
        self
    }

    pub fn with_after_read(mut self, hook: impl Fn(Bytes) -> Bytes + Send + Sync + 'static) -> Self {
        self.after_read = Some(Box::new(hook));
        self
    }
}

#[async_trait]
impl<P: PersistencePort> PersistencePort for HookedPersistence<P> {
    async fn open(&self, client_id: &str, server_uri: &str) -> Result<()> {
        self.inner.open(client_id, server_uri).await
    }

    async fn put(&self, client_id: &str, key: &str, buffers: &[Bytes]) -> Result<()> {
        let transformed;
        let buffers = match &self.before_write {
            Some(hook) => {
                transformed = hook(buffers.to_vec());
                &transformed[..]
            }
            None => buffers,
        };
        self.inner.put(client_id, key, buffers).await
    }

    async fn get(&self, client_id: &str, key: &str) -> Result<Option<Bytes>> {
        let value = self.inner.get(client_id, key).await?;
        Ok(match (value, &self.after_read) {
            (Some(v), Some(hook)) => Some(hook(v)),
            (v, _) => v,
        })
    }

    async fn remove(&self, client_id: &str, key: &str) -> Result<()> {
        self.inner.remove(client_id, key).await
    }

    async fn keys(&self, client_id: &str) -> Result<Vec<String>> {
        self.inner.keys(client_id).await
    }

    async fn clear(&self, client_id: &str) -> Result<()> {
        self.inner.clear(client_id).await
    }

    async fn close(&self, client_id: &str) -> Result<()> {
        self.inner.close(client_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrip() {
        let key = make_key(KeyTag::SentPublishV5, 42);
        assert_eq!(key, "s5-42");
        assert_eq!(parse_key(&key), Some((KeyTag::SentPublishV5, 42)));
    }

    #[test]
    fn parse_key_rejects_unknown_prefix() {
        assert_eq!(parse_key("z-1"), None);
        assert_eq!(parse_key("no-dash"), None);
    }
}
