//! Session and transaction bookkeeping.
//!
//! A [`SessionSlot`] owns at most one backend session and remembers whether it
//! is inside a transaction. Contexts keep one slot for their ambient session and
//! every repository keeps one for its dedicated session.
//!
//! [`resolve`] picks the session an operation runs in:
//!
//! 1. a repository that already owns a dedicated session uses it, starting its
//!    transaction if needed;
//! 2. otherwise, unless a transaction is forced, the context's ambient session is
//!    used when the context runs ambient transactions;
//! 3. a forced transaction lazily creates the dedicated session;
//! 4. anything else runs without a session.

use log::{info, trace};
use mea::mutex::Mutex;

use crate::{
    backend::{SessionId, StoreBackend},
    error::{DocumentStoreError, DocumentStoreResult},
};

/// A session handle and its transaction state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    id: SessionId,
    in_transaction: bool,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Whether a transaction was open on the session when this handle was taken.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

/// What happens to a slot after its transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterTransaction {
    /// Replace the ended session with a fresh one right away.
    Replace,
    /// Leave the slot empty; a session is created on next use.
    Release,
}

/// Holder of at most one session.
#[derive(Debug)]
pub struct SessionSlot {
    label: &'static str,
    handle: Mutex<Option<SessionHandle>>,
}

impl SessionSlot {
    /// An empty slot. `label` only appears in log messages.
    pub fn new(label: &'static str) -> Self {
        Self { label, handle: Mutex::new(None) }
    }

    /// A snapshot of the held session, if any.
    pub async fn current(&self) -> Option<SessionHandle> {
        self.handle.lock().await.clone()
    }

    /// Whether the slot holds a session.
    pub async fn exists(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Returns the held session, creating one when the slot is empty.
    pub async fn ensure_session<B: StoreBackend + ?Sized>(&self, backend: &B) -> DocumentStoreResult<SessionId> {
        let mut handle = self.handle.lock().await;

        match handle.as_ref() {
            Some(existing) => Ok(existing.id.clone()),
            None => {
                let id = backend.start_session().await?;
                trace!("{} session {id} created", self.label);
                *handle = Some(SessionHandle { id: id.clone(), in_transaction: false });
                Ok(id)
            }
        }
    }

    /// Returns the held session inside a transaction, creating the session and
    /// starting the transaction as needed. Repeated calls reuse both.
    pub async fn ensure_transaction<B: StoreBackend + ?Sized>(&self, backend: &B) -> DocumentStoreResult<SessionId> {
        let mut handle = self.handle.lock().await;

        let current = match handle.take() {
            Some(existing) => existing,
            None => {
                let id = backend.start_session().await?;
                trace!("{} session {id} created", self.label);
                SessionHandle { id, in_transaction: false }
            }
        };

        if current.in_transaction {
            let id = current.id.clone();
            *handle = Some(current);
            return Ok(id);
        }

        match backend.start_transaction(&current.id).await {
            Ok(()) => {
                trace!("{} session {} entered a transaction", self.label, current.id);
                let id = current.id.clone();
                *handle = Some(SessionHandle { in_transaction: true, ..current });
                Ok(id)
            }
            Err(e) => {
                *handle = Some(current);
                Err(e)
            }
        }
    }

    /// Commits the held transaction.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::NoActiveTransaction`] when the slot holds no session
    /// in a transaction.
    pub async fn commit<B: StoreBackend + ?Sized>(&self, backend: &B, after: AfterTransaction) -> DocumentStoreResult<()> {
        self.finish(backend, after, true).await
    }

    /// Aborts the held transaction, discarding its writes.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::NoActiveTransaction`] when the slot holds no session
    /// in a transaction.
    pub async fn abort<B: StoreBackend + ?Sized>(&self, backend: &B, after: AfterTransaction) -> DocumentStoreResult<()> {
        self.finish(backend, after, false).await
    }

    async fn finish<B: StoreBackend + ?Sized>(
        &self,
        backend: &B,
        after: AfterTransaction,
        commit: bool,
    ) -> DocumentStoreResult<()> {
        let mut handle = self.handle.lock().await;

        let current = match handle.take() {
            Some(current) if current.in_transaction => current,
            other => {
                *handle = other;
                return Err(DocumentStoreError::NoActiveTransaction);
            }
        };

        let outcome = if commit {
            backend.commit_transaction(&current.id).await
        } else {
            backend.abort_transaction(&current.id).await
        };
        if let Err(e) = outcome {
            *handle = Some(current);
            return Err(e);
        }

        info!(
            "{} transaction on session {} {}",
            self.label,
            current.id,
            if commit { "committed" } else { "aborted" }
        );
        backend.end_session(current.id).await?;

        if after == AfterTransaction::Replace {
            let id = backend.start_session().await?;
            trace!("{} session {id} created as replacement", self.label);
            *handle = Some(SessionHandle { id, in_transaction: false });
        }

        Ok(())
    }

    /// Aborts any open transaction and ends the session, leaving the slot empty.
    pub async fn close<B: StoreBackend + ?Sized>(&self, backend: &B) -> DocumentStoreResult<()> {
        let mut handle = self.handle.lock().await;

        if let Some(current) = handle.take() {
            if current.in_transaction {
                backend.abort_transaction(&current.id).await?;
                info!("{} transaction on session {} aborted on close", self.label, current.id);
            }
            backend.end_session(current.id).await?;
        }

        Ok(())
    }
}

/// Picks the session an operation runs in.
///
/// `ambient` is the context's shared slot when the context runs ambient
/// transactions, `None` otherwise.
pub async fn resolve<B: StoreBackend + ?Sized>(
    backend: &B,
    dedicated: &SessionSlot,
    ambient: Option<&SessionSlot>,
    force_transaction: Option<bool>,
) -> DocumentStoreResult<Option<SessionId>> {
    if dedicated.exists().await {
        return dedicated.ensure_transaction(backend).await.map(Some);
    }

    match (force_transaction, ambient) {
        (Some(true), _) => dedicated.ensure_transaction(backend).await.map(Some),
        (_, Some(ambient)) => ambient.ensure_transaction(backend).await.map(Some),
        _ => Ok(None),
    }
}
