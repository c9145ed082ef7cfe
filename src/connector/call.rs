//! Pending call records and request abort handles

use bytes::Bytes;
use hyper::Method;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use url::Url;

use crate::connector::bridge::Completion;
use crate::connector::connection::Connection;
use crate::models::{CallResult, ClientRequest, Destination};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// One outstanding request/response pair
pub struct PendingCall {
    id: u64,
    method: Method,
    url: Url,
    confidential: bool,
    expecting_response: bool,
    destination: Option<Destination>,
    wire: Bytes,
    completion: Completion,
    abort: AbortHandle,
    created_at: Instant,
}

impl PendingCall {
    pub fn new(
        request: &ClientRequest,
        destination: Option<Destination>,
        wire: Bytes,
        completion: Completion,
    ) -> Self {
        Self {
            id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            method: request.method.clone(),
            url: request.url.clone(),
            confidential: request.confidential,
            expecting_response: request.expecting_response,
            destination,
            wire,
            completion,
            abort: request.abort_handle(),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_confidential(&self) -> bool {
        self.confidential
    }

    pub fn expecting_response(&self) -> bool {
        self.expecting_response
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    /// Serialized request bytes
    pub fn wire(&self) -> &Bytes {
        &self.wire
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        &self.abort
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Release the caller. Only the first release has any effect.
    pub fn unblock(&self, result: CallResult) -> bool {
        self.completion.unblock(result)
    }

    pub fn is_released(&self) -> bool {
        self.completion.is_released()
    }
}

struct AbortState {
    aborted: AtomicBool,
    connection: Mutex<Option<Weak<Connection>>>,
}

/// Cancels a request from any task.
///
/// Aborting a request that is already bound to a connection closes that
/// connection, failing every message queued or in flight on it.
#[derive(Clone)]
pub struct AbortHandle {
    state: Arc<AbortState>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AbortState {
                aborted: AtomicBool::new(false),
                connection: Mutex::new(None),
            }),
        }
    }

    pub fn abort(&self) {
        self.state.aborted.store(true, Ordering::SeqCst);

        let connection = self
            .state
            .connection
            .lock()
            .as_ref()
            .and_then(Weak::upgrade);

        if let Some(connection) = connection {
            connection.abort();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::SeqCst)
    }

    /// Bind the request to the connection carrying it.
    /// Returns false when the request was aborted first.
    pub(crate) fn attach(&self, connection: &Arc<Connection>) -> bool {
        let mut slot = self.state.connection.lock();
        if self.is_aborted() {
            return false;
        }
        *slot = Some(Arc::downgrade(connection));
        true
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}
