//! Blocking/unblocking bridge between connections and callers
//!
//! Each pending call owns a [`Completion`]. Synchronous callers park on the
//! paired [`Waiter`]; asynchronous callers get their callback invoked. Many
//! paths may try to release the same call (response, timeout, capacity
//! failure, I/O error) and only the first one has any effect.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::connector::call::PendingCall;
use crate::error::Error;
use crate::models::{CallResult, ExchangeLog, ResponseCallback};
use crate::utils::{elapsed_ms, log_exchange_completed, now};

enum Release {
    Latch(oneshot::Sender<CallResult>),
    Callback(ResponseCallback),
}

/// Single-shot release slot of one pending call
pub struct Completion {
    release: Mutex<Option<Release>>,
}

impl Completion {
    /// Synchronous mode: a completion plus the waiter the caller parks on.
    pub fn latch() -> (Self, Waiter) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            release: Mutex::new(Some(Release::Latch(tx))),
        };
        (completion, Waiter { rx })
    }

    /// Asynchronous mode: the callback receives the result.
    pub fn callback(callback: ResponseCallback) -> Self {
        Self {
            release: Mutex::new(Some(Release::Callback(callback))),
        }
    }

    /// Deliver the result. Returns false when the call was already released.
    pub fn unblock(&self, result: CallResult) -> bool {
        let release = self.release.lock().take();

        match release {
            Some(Release::Latch(tx)) => {
                // The waiter may be gone already; the release still counts.
                let _ = tx.send(result);
                true
            }
            Some(Release::Callback(callback)) => {
                callback(result);
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.release.lock().is_none()
    }

    /// Consume the release slot without delivering anything.
    fn disarm(&self) -> bool {
        self.release.lock().take().is_some()
    }
}

/// Receiving side of a synchronous call
pub struct Waiter {
    rx: oneshot::Receiver<CallResult>,
}

impl Waiter {
    /// Park until the call is released or `timeout` elapses.
    ///
    /// On timeout the completion is disarmed so a late response is dropped.
    /// If a release won the race against the timer, its result is returned.
    pub async fn wait(mut self, completion: &Completion, timeout: Duration) -> CallResult {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Communication("call dropped before completion".to_string())),
            Err(_) => {
                if completion.disarm() {
                    Err(Error::Timeout(timeout))
                } else {
                    self.rx
                        .await
                        .unwrap_or_else(|_| Err(Error::Communication("call dropped before completion".to_string())))
                }
            }
        }
    }
}

/// Shared results sink: every outcome of every call passes through here
#[derive(Default)]
pub struct ResponseSink {
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    discarded: AtomicU64,
}

impl ResponseSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release a call with its result and record the outcome.
    pub fn deliver(&self, call: &PendingCall, result: CallResult) -> bool {
        let mut entry = ExchangeLog {
            call_id: call.id(),
            method: call.method().to_string(),
            url: call.url().to_string(),
            destination: call
                .destination()
                .map(|d| d.to_string())
                .unwrap_or_default(),
            status: None,
            error: None,
            elapsed_ms: elapsed_ms(call.created_at()),
            timestamp: now(),
        };

        match &result {
            Ok(response) => entry.status = Some(response.status.as_u16()),
            Err(e) => entry.error = Some(e.to_string()),
        }
        let succeeded = result.is_ok();

        if !call.unblock(result) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            log::debug!("Discarding result for already released call {}", call.id());
            return false;
        }

        if succeeded {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        log_exchange_completed(&entry);
        true
    }

    /// Record a synchronous caller that gave up waiting.
    pub fn record_timeout(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}
