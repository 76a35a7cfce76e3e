// One shared remote session per store, held open while any operation runs
use super::RemoteBackend;
use crate::error::StoreResult;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

struct SessionSlot<S> {
    session: Option<S>,
    holders: usize,
}

/// Hands out the store's session, connecting on first use and
/// disconnecting when the last holder releases it.
pub struct SessionManager<B: RemoteBackend> {
    backend: Arc<B>,
    slot: Arc<Mutex<SessionSlot<B::Session>>>,
}

impl<B: RemoteBackend> SessionManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            slot: Arc::new(Mutex::new(SessionSlot {
                session: None,
                holders: 0,
            })),
        }
    }

    /// Join the open session, or open one.
    pub async fn acquire(&self) -> StoreResult<Connection<B>> {
        {
            let mut slot = self.lock();
            if let Some(session) = slot.session.clone() {
                slot.holders += 1;
                return Ok(self.connection(session));
            }
        }

        let fresh = self.backend.connect().await?;
        let (session, surplus) = {
            let mut slot = self.lock();
            slot.holders += 1;
            match slot.session.clone() {
                // Another task connected while we were connecting
                Some(existing) => (existing, Some(fresh)),
                None => {
                    slot.session = Some(fresh.clone());
                    (fresh, None)
                }
            }
        };
        if let Some(extra) = surplus {
            if let Err(e) = self.backend.disconnect(extra).await {
                warn!("Failed to close surplus session: {}", e);
            }
        } else {
            debug!("Opened remote session");
        }
        Ok(self.connection(session))
    }

    pub fn is_connected(&self) -> bool {
        self.lock().session.is_some()
    }

    pub fn holders(&self) -> usize {
        self.lock().holders
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionSlot<B::Session>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self, session: B::Session) -> Connection<B> {
        Connection {
            backend: Arc::clone(&self.backend),
            slot: Arc::clone(&self.slot),
            session,
            released: false,
        }
    }
}

/// A hold on the shared session.
///
/// Call [`Connection::release`] when done; a connection dropped without
/// release (a panic, a cancelled future) still gives up its hold and the
/// session is closed in the background.
pub struct Connection<B: RemoteBackend> {
    backend: Arc<B>,
    slot: Arc<Mutex<SessionSlot<B::Session>>>,
    session: B::Session,
    released: bool,
}

impl<B: RemoteBackend> Connection<B> {
    pub fn session(&self) -> &B::Session {
        &self.session
    }

    /// Give up this hold, returning the session if it was the last one.
    fn give_up(&mut self) -> Option<B::Session> {
        self.released = true;
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.holders = slot.holders.saturating_sub(1);
        if slot.holders == 0 {
            slot.session.take()
        } else {
            None
        }
    }

    /// Release, then hand back the outcome of the work done under this
    /// hold. A failed disconnect is logged and never replaces `result`.
    pub async fn finish<T>(self, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(e) = self.release().await {
            warn!("Failed to close remote session: {}", e);
        }
        result
    }

    pub async fn release(mut self) -> StoreResult<()> {
        match self.give_up() {
            Some(session) => {
                debug!("Closing remote session");
                self.backend.disconnect(session).await
            }
            None => Ok(()),
        }
    }
}

impl<B: RemoteBackend> Drop for Connection<B> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(session) = self.give_up() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let backend = Arc::clone(&self.backend);
                handle.spawn(async move {
                    if let Err(e) = backend.disconnect(session).await {
                        warn!("Failed to close remote session: {}", e);
                    }
                });
            }
            Err(_) => warn!("Remote session dropped outside a runtime; not closed cleanly"),
        }
    }
}
