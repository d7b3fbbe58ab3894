//! Message handlers keyed by message type.
//!
//! Handlers run synchronously on the reactor thread that owns the
//! connection, so a slow handler stalls every connection on that thread.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tlvrpc_protocol::{ERROR_TYPE, TYPE_MASK};

/// Maps a request body to a response body.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, body: &[u8]) -> Bytes;
}

impl<F> MessageHandler for F
where
    F: Fn(&[u8]) -> Bytes + Send + Sync,
{
    fn handle(&self, body: &[u8]) -> Bytes {
        self(body)
    }
}

/// Result of dispatching one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    /// Type of the response frame: the request type, or [`ERROR_TYPE`].
    pub msg_type: u8,
    pub body: Bytes,
    /// Whether the fallback error handler answered.
    pub unknown_type: bool,
}

/// A handler panicked while processing a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerPanic {
    pub msg_type: u8,
    pub message: String,
}

impl fmt::Display for HandlerPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handler for type {} panicked: {}",
            self.msg_type, self.message
        )
    }
}

/// Handler table shared by every reactor of a server.
#[derive(Clone)]
pub struct HandlerTable {
    handlers: HashMap<u8, Arc<dyn MessageHandler>>,
    error_handler: Arc<dyn MessageHandler>,
}

impl HandlerTable {
    /// Creates an empty table whose error handler answers with an empty body.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            error_handler: Arc::new(|_: &[u8]| Bytes::new()),
        }
    }

    /// Registers a handler. Only the low seven bits of `msg_type` are used.
    pub fn with_handler(mut self, msg_type: u8, handler: impl MessageHandler + 'static) -> Self {
        self.insert(msg_type, handler);
        self
    }

    /// Replaces the fallback used for unregistered types.
    pub fn with_error_handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    pub fn insert(&mut self, msg_type: u8, handler: impl MessageHandler + 'static) {
        let msg_type = msg_type & TYPE_MASK;
        if msg_type == ERROR_TYPE {
            tracing::warn!(
                "Handler registered for reserved error type {}; it shadows the error handler",
                ERROR_TYPE
            );
        }
        self.handlers.insert(msg_type, Arc::new(handler));
    }

    pub fn contains(&self, msg_type: u8) -> bool {
        self.handlers.contains_key(&msg_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler for `msg_type`, falling back to the error handler.
    ///
    /// A panicking handler is contained here so it cannot unwind through the
    /// reactor loop.
    pub fn dispatch(&self, msg_type: u8, body: &[u8]) -> Result<Dispatched, HandlerPanic> {
        let (handler, response_type, unknown_type) = match self.handlers.get(&msg_type) {
            Some(h) => (h, msg_type, false),
            None => (&self.error_handler, ERROR_TYPE, true),
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(body))) {
            Ok(body) => Ok(Dispatched {
                msg_type: response_type,
                body,
                unknown_type,
            }),
            Err(payload) => Err(HandlerPanic {
                msg_type,
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        f.debug_struct("HandlerTable")
            .field("types", &types)
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
