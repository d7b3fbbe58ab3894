//! Cooperative shutdown for reactor threads.

use mio::Waker;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stop flag plus one waker per reactor poll.
///
/// Reactors check the flag at the top of every loop iteration. Waking every
/// poll makes a blocked `poll()` return so the flag is seen promptly.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<Inner>,
}

struct Inner {
    requested: AtomicBool,
    wakers: Vec<Arc<Waker>>,
}

impl ShutdownHandle {
    pub(crate) fn new(wakers: Vec<Arc<Waker>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                requested: AtomicBool::new(false),
                wakers,
            }),
        }
    }

    /// Requests shutdown. Calling it again has no effect.
    pub fn shutdown(&self) {
        if self.inner.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Server shutting down");
        for waker in &self.inner.wakers {
            if let Err(e) = waker.wake() {
                tracing::warn!("Failed to wake reactor: {}", e);
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("requested", &self.is_shutdown())
            .field("reactors", &self.inner.wakers.len())
            .finish()
    }
}
