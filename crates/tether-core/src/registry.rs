//! Document → kernel session mapping.

use rustc_hash::FxHashMap;

use crate::document::DocumentId;
use crate::error::{Error, Result, TeardownFailure};
use crate::session::KernelSession;

/// Teardown hook the registry drives.
pub trait ManagedSession {
    /// Release the session's resources. Must tolerate repeated calls.
    fn deinit(&mut self) -> Result<()>;
}

impl ManagedSession for KernelSession {
    fn deinit(&mut self) -> Result<()> {
        KernelSession::deinit(self)
    }
}

/// At most one session per document.
///
/// Sessions are only ever created explicitly through [`register`]; lookups
/// never start a kernel behind the caller's back.
///
/// [`register`]: SessionRegistry::register
#[derive(Debug)]
pub struct SessionRegistry<S = KernelSession> {
    sessions: FxHashMap<DocumentId, S>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: FxHashMap::default(),
        }
    }
}

impl<S: ManagedSession> SessionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session for `document`. Fails with `NoActiveSession` when `require`
    /// is set and there is none.
    pub fn get_or_require(
        &self,
        document: DocumentId,
        require: bool,
    ) -> Result<Option<&S>> {
        match self.sessions.get(&document) {
            Some(session) => Ok(Some(session)),
            None if require => Err(Error::NoActiveSession(document)),
            None => Ok(None),
        }
    }

    /// Mutable session for `document`, which must exist.
    pub fn require_mut(&mut self, document: DocumentId) -> Result<&mut S> {
        self.sessions
            .get_mut(&document)
            .ok_or(Error::NoActiveSession(document))
    }

    pub fn contains(&self, document: DocumentId) -> bool {
        self.sessions.contains_key(&document)
    }

    /// Bind a session to a document.
    ///
    /// On `AlreadyInitialized` the rejected session is shut down before the
    /// error is returned; the existing one is untouched.
    pub fn register(&mut self, document: DocumentId, mut session: S) -> Result<()> {
        if self.sessions.contains_key(&document) {
            if let Err(e) = session.deinit() {
                tracing::warn!("Failed to close rejected session: {}", e);
            }
            return Err(Error::AlreadyInitialized(document));
        }
        tracing::debug!("Registered session for document {}", document);
        self.sessions.insert(document, session);
        Ok(())
    }

    /// Shut down and forget the session for `document`. No-op if absent.
    pub fn unregister_and_deinit(&mut self, document: DocumentId) -> Result<()> {
        match self.sessions.remove(&document) {
            Some(mut session) => session.deinit(),
            None => Ok(()),
        }
    }

    /// Tear down every session, in document order.
    ///
    /// Failures do not stop the remaining teardowns; they are collected into
    /// one `Teardown` error.
    pub fn deinit_all(&mut self) -> Result<()> {
        let mut documents: Vec<DocumentId> = self.sessions.keys().copied().collect();
        documents.sort();

        let failures: Vec<TeardownFailure> = documents
            .into_iter()
            .filter_map(|document| {
                self.unregister_and_deinit(document).err().map(|error| {
                    tracing::warn!("Teardown of document {} failed: {}", document, error);
                    TeardownFailure { document, error }
                })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(failures))
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (DocumentId, &mut S)> {
        self.sessions.iter_mut().map(|(doc, session)| (*doc, session))
    }

    pub fn documents(&self) -> Vec<DocumentId> {
        let mut documents: Vec<DocumentId> = self.sessions.keys().copied().collect();
        documents.sort();
        documents
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
