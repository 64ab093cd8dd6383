//! Persistence layer for the pipeline session

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteSessionStore;

use crate::core::{ImagePayload, PipelineSession};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

/// Trait for session persistence backends
///
/// Backends may store image bytes separately from the session and leave
/// `ImagePayload::Stored` references in what `load` returns; `hydrate`
/// turns those references back into inline bytes.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the persisted session, if any
    async fn load(&self) -> Result<Option<PipelineSession>>;

    /// Persist the full session (write-through, no diffing)
    async fn save(&self, session: &PipelineSession) -> Result<()>;

    /// Discard the persisted session
    async fn clear(&self) -> Result<()>;

    /// Resolve every stored reference in `session` into inline content
    async fn hydrate(&self, session: &mut PipelineSession) -> Result<()>;

    /// When the session was last saved
    async fn updated_at(&self) -> Result<Option<DateTime<Utc>>>;
}

/// Move inline image bytes out of a session, leaving stored references
/// keyed by filename. Returns the extracted blobs.
pub fn dehydrate(session: &mut PipelineSession) -> Vec<(String, Arc<[u8]>)> {
    let mut blobs = Vec::new();
    for image in session.context.artifacts.images.values_mut() {
        let key = image.file_name.clone();
        let stored = ImagePayload::Stored { key: key.clone() };
        if let ImagePayload::Inline { bytes } = std::mem::replace(&mut image.payload, stored) {
            blobs.push((key, bytes));
        }
    }
    blobs
}

/// Replace stored references using `lookup`; fails on a dangling reference
pub fn hydrate_with<F>(session: &mut PipelineSession, mut lookup: F) -> Result<()>
where
    F: FnMut(&str) -> Option<Arc<[u8]>>,
{
    for image in session.context.artifacts.images.values_mut() {
        if let ImagePayload::Stored { key } = &image.payload {
            let bytes = lookup(key)
                .with_context(|| format!("Stored image '{}' is missing", key))?;
            image.payload = ImagePayload::Inline { bytes };
        }
    }
    Ok(())
}

/// In-memory persistence (for testing or ephemeral use)
pub struct InMemorySessionStore {
    session: RwLock<Option<(PipelineSession, DateTime<Utc>)>>,
    blobs: RwLock<HashMap<String, Arc<[u8]>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            session: RwLock::new(None),
            blobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self) -> Result<Option<PipelineSession>> {
        Ok(self
            .session
            .read()
            .await
            .as_ref()
            .map(|(session, _)| session.clone()))
    }

    async fn save(&self, session: &PipelineSession) -> Result<()> {
        let mut record = session.clone();
        record.busy = false;
        let extracted = dehydrate(&mut record);

        let mut blobs = self.blobs.write().await;
        blobs.clear();
        blobs.extend(extracted);
        *self.session.write().await = Some((record, Utc::now()));
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.session.write().await = None;
        self.blobs.write().await.clear();
        Ok(())
    }

    async fn hydrate(&self, session: &mut PipelineSession) -> Result<()> {
        let blobs = self.blobs.read().await;
        hydrate_with(session, |key| blobs.get(key).cloned())
    }

    async fn updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.session.read().await.as_ref().map(|(_, at)| *at))
    }
}

enum WriteCommand {
    Save(Box<PipelineSession>),
    Clear,
    Flush(oneshot::Sender<()>),
}

/// Ordered, fire-and-forget writer in front of a [`SessionStore`]
///
/// Commands are applied one at a time by a background task in the order
/// they were queued. Consecutive queued saves collapse into the newest one.
/// Failures are logged, never propagated.
#[derive(Clone)]
pub struct SessionWriter {
    tx: mpsc::UnboundedSender<WriteCommand>,
}

impl SessionWriter {
    /// Spawn the writer task. Must be called from within a tokio runtime.
    pub fn spawn(store: Arc<dyn SessionStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteCommand>();

        tokio::spawn(async move {
            let mut pending: Option<WriteCommand> = None;
            loop {
                let command = match pending.take() {
                    Some(command) => command,
                    None => match rx.recv().await {
                        Some(command) => command,
                        None => break,
                    },
                };

                match command {
                    WriteCommand::Save(mut session) => {
                        while let Ok(next) = rx.try_recv() {
                            match next {
                                WriteCommand::Save(newer) => session = newer,
                                other => {
                                    pending = Some(other);
                                    break;
                                }
                            }
                        }
                        if let Err(e) = store.save(&session).await {
                            warn!("Failed to persist session: {:#}", e);
                        }
                    }
                    WriteCommand::Clear => {
                        if let Err(e) = store.clear().await {
                            warn!("Failed to clear persisted session: {:#}", e);
                        }
                    }
                    WriteCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Session writer stopped");
        });

        Self { tx }
    }

    pub fn save(&self, session: PipelineSession) {
        self.send(WriteCommand::Save(Box::new(session)));
    }

    pub fn clear(&self) {
        self.send(WriteCommand::Clear);
    }

    /// Wait until every previously queued command has been applied
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(WriteCommand::Flush(done));
        let _ = wait.await;
    }

    fn send(&self, command: WriteCommand) {
        if self.tx.send(command).is_err() {
            warn!("Session writer is gone; dropping persistence command");
        }
    }
}
