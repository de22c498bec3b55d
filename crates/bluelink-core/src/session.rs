//! Exclusive long-running sessions
//!
//! A Central scan and a Peripheral advertisement share the same discipline:
//! at most one in flight per owner, and the native stop primitive runs on
//! every exit path. [`SessionSlot`] enforces the first; [`SessionGuard`] the
//! second, including when the caller drops the session future mid-flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::BleResult;
use crate::resource::Resource;
use crate::sync::lock;

#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    id: u64,
    /// Fired by `stop_*` to end the session normally
    pub(crate) stop: CancellationToken,
    /// Fired once the session's exit path has completed
    done: CancellationToken,
}

impl SessionHandle {
    /// Ask the session to end and wait for its exit path. Returns false if it
    /// did not finish within `grace`.
    pub(crate) async fn stop_and_wait(&self, grace: Duration) -> bool {
        self.stop.cancel();
        tokio::time::timeout(grace, self.done.cancelled()).await.is_ok()
    }
}

#[derive(Debug, Default)]
pub(crate) struct SessionSlot {
    current: Mutex<Option<SessionHandle>>,
    next_id: AtomicU64,
}

impl SessionSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claim the slot; `None` when a session is already active
    pub(crate) fn try_begin(&self) -> Option<SessionHandle> {
        let mut current = lock(&self.current);
        if current.is_some() {
            return None;
        }
        let handle = SessionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            stop: CancellationToken::new(),
            done: CancellationToken::new(),
        };
        *current = Some(handle.clone());
        Some(handle)
    }

    pub(crate) fn current(&self) -> Option<SessionHandle> {
        lock(&self.current).clone()
    }

    pub(crate) fn is_active(&self) -> bool {
        lock(&self.current).is_some()
    }

    pub(crate) fn release(&self, handle: &SessionHandle) {
        {
            let mut current = lock(&self.current);
            if current.as_ref().map(|c| c.id) == Some(handle.id) {
                *current = None;
            }
        }
        handle.done.cancel();
    }
}

/// The object owning a session slot
#[async_trait]
pub(crate) trait SessionOwner: Clone + Send + Sync + 'static {
    /// Invoke the native stop primitive
    async fn stop_native(&self) -> BleResult<()>;

    /// Drop the session's bookkeeping: the slot, and `registered` when this
    /// session put it in the resource table
    fn release_session(&self, handle: &SessionHandle, registered: Option<&Arc<dyn Resource>>);
}

/// Runs the owner's exit path exactly once: through [`SessionGuard::finish`],
/// or from `Drop` when the session future is abandoned.
///
/// The native stop only runs once [`SessionGuard::native_started`] was
/// called, and only the resource recorded by [`SessionGuard::registered`]
/// is removed from the table.
pub(crate) struct SessionGuard<O: SessionOwner> {
    owner: O,
    handle: SessionHandle,
    registered: Option<Arc<dyn Resource>>,
    started: bool,
    finished: bool,
}

impl<O: SessionOwner> SessionGuard<O> {
    pub(crate) fn new(owner: O, handle: SessionHandle) -> Self {
        Self {
            owner,
            handle,
            registered: None,
            started: false,
            finished: false,
        }
    }

    pub(crate) fn registered(&mut self, resource: Arc<dyn Resource>) {
        self.registered = Some(resource);
    }

    /// Record that the native start primitive is about to be invoked
    pub(crate) fn native_started(&mut self) {
        self.started = true;
    }

    pub(crate) async fn finish(mut self) -> BleResult<()> {
        self.finished = true;
        let result = if self.started {
            self.owner.stop_native().await
        } else {
            Ok(())
        };
        self.owner.release_session(&self.handle, self.registered.as_ref());
        result
    }
}

impl<O: SessionOwner> Drop for SessionGuard<O> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let owner = self.owner.clone();
        let handle = self.handle.clone();
        let registered = self.registered.take();
        if !self.started {
            owner.release_session(&handle, registered.as_ref());
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = owner.stop_native().await {
                        warn!("Native stop after abandoned session failed: {}", err);
                    }
                    owner.release_session(&handle, registered.as_ref());
                });
            }
            Err(_) => {
                warn!("Session abandoned outside a runtime; native stop skipped");
                owner.release_session(&handle, registered.as_ref());
            }
        }
    }
}
