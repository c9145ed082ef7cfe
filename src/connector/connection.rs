//! A pooled client connection
//!
//! State machine: `Opening -> Open -> Closing -> Closed`. Callers never touch
//! the socket: a writer task drains the outbound queue in FIFO order and a
//! reader task matches each response to the oldest in-flight call, handing
//! the result to the shared [`ResponseSink`].

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::io::{split, AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{watch, Notify};

use crate::connector::bridge::ResponseSink;
use crate::connector::call::PendingCall;
use crate::connector::codec::read_response;
use crate::connector::pool::ConnectionIndex;
use crate::connector::socket_factory::{BoxedStream, SocketFactory};
use crate::error::{Error, Result};
use crate::models::{ClientResponse, Destination};
use crate::utils::{elapsed_ms, log_connection_closed, log_connection_failure, log_connection_opened, log_message_written};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Opening => "OPENING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Per-connection policy shared by every connection of a pool
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Queued plus in-flight messages accepted before the connection is busy
    pub pipeline_depth: usize,
    /// Keep the connection after an exchange
    pub persistent: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            pipeline_depth: 1,
            persistent: true,
        }
    }
}

#[derive(Default)]
struct Queues {
    /// Enqueued, not yet written
    outbound: VecDeque<Arc<PendingCall>>,
    /// Written, awaiting a response, oldest first
    in_flight: VecDeque<Arc<PendingCall>>,
}

pub struct Connection {
    id: u64,
    destination: Destination,
    secure: bool,
    options: ConnectionOptions,
    persistent: AtomicBool,
    state: Mutex<ConnectionState>,
    queues: Mutex<Queues>,
    // Mirror of outbound + in-flight length, read without locking
    load: AtomicUsize,
    enqueued_total: AtomicUsize,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    wake_writer: Notify,
    closed: watch::Sender<bool>,
    sink: Arc<ResponseSink>,
    index: Weak<ConnectionIndex>,
    created_at: Instant,
}

impl Connection {
    pub fn new(
        id: u64,
        destination: Destination,
        secure: bool,
        options: ConnectionOptions,
        sink: Arc<ResponseSink>,
        index: Weak<ConnectionIndex>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            destination,
            secure,
            options,
            persistent: AtomicBool::new(options.persistent),
            state: Mutex::new(ConnectionState::Opening),
            queues: Mutex::new(Queues::default()),
            load: AtomicUsize::new(0),
            enqueued_total: AtomicUsize::new(0),
            writer: tokio::sync::Mutex::new(None),
            wake_writer: Notify::new(),
            closed,
            sink,
            index,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Queued plus in-flight messages (approximate when read concurrently)
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    /// Connect through `factory` and start the reader and writer tasks.
    ///
    /// On failure every call already queued here receives the error and the
    /// connection leaves the pool.
    pub async fn open(self: &Arc<Self>, factory: &dyn SocketFactory) -> Result<()> {
        let started = Instant::now();

        let stream = match factory.create_socket(&self.destination).await {
            Ok(stream) => stream,
            Err(e) => {
                log_connection_failure(self.id, &self.destination, elapsed_ms(started), &e.to_string());
                self.fail(e.clone(), "connect failed");
                self.mark_closed();
                return Err(e);
            }
        };

        let (read_half, write_half) = split(stream);
        *self.writer.lock().await = Some(write_half);

        let opened = {
            let mut state = self.state.lock();
            let opening = *state == ConnectionState::Opening;
            if opening {
                *state = ConnectionState::Open;
            }
            opening
        };

        if !opened {
            // Aborted while connecting
            self.shutdown_writer().await;
            return Err(Error::Communication(format!("connection #{} closed while opening", self.id)));
        }

        log_connection_opened(self.id, &self.destination, self.secure, elapsed_ms(started));

        tokio::spawn(self.clone().read_loop(read_half));
        tokio::spawn(self.clone().write_loop());
        self.wake_writer.notify_one();

        Ok(())
    }

    fn is_reusable(&self) -> bool {
        self.persistent.load(Ordering::Acquire) || self.enqueued_total.load(Ordering::Acquire) == 0
    }

    /// Open and below the pipeline limit
    pub fn can_enqueue(&self) -> bool {
        self.state() == ConnectionState::Open
            && self.is_reusable()
            && self.load() < self.options.pipeline_depth
    }

    /// Still able to take queued work, even if it has to wait
    pub fn accepts_more(&self) -> bool {
        matches!(self.state(), ConnectionState::Opening | ConnectionState::Open) && self.is_reusable()
    }

    /// Append a call to the outbound queue and wake the writer.
    pub fn enqueue(&self, call: Arc<PendingCall>) -> Result<()> {
        {
            let mut queues = self.queues.lock();
            let state = *self.state.lock();
            if !matches!(state, ConnectionState::Opening | ConnectionState::Open) || !self.is_reusable() {
                return Err(Error::Communication(format!(
                    "connection #{} to {} no longer accepts messages ({})",
                    self.id, self.destination, state
                )));
            }
            queues.outbound.push_back(call);
            self.load.fetch_add(1, Ordering::AcqRel);
            self.enqueued_total.fetch_add(1, Ordering::AcqRel);
        }

        self.wake_writer.notify_one();
        Ok(())
    }

    /// Write queued messages in FIFO order, up to the pipeline limit.
    ///
    /// A write failure fails the connection and every message on it.
    pub async fn write_messages(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;

        loop {
            let call = {
                let mut queues = self.queues.lock();
                if self.state() != ConnectionState::Open
                    || queues.in_flight.len() >= self.options.pipeline_depth
                {
                    return Ok(());
                }
                match queues.outbound.pop_front() {
                    Some(call) => {
                        queues.in_flight.push_back(call.clone());
                        call
                    }
                    None => return Ok(()),
                }
            };

            let Some(stream) = writer.as_mut() else {
                return Ok(());
            };

            let written = match stream.write_all(call.wire()).await {
                Ok(()) => stream.flush().await,
                Err(e) => Err(e),
            };

            if let Err(e) = written {
                drop(writer);
                let error = Error::Communication(format!("write to {} failed: {}", self.destination, e));
                self.fail(error.clone(), "write failed");
                return Err(error);
            }

            log_message_written(self.id, call.id(), call.wire().len());

            if !call.expecting_response() {
                self.sink.deliver(&call, Ok(ClientResponse::written()));
            }
        }
    }

    /// Flush what can be written, then close. Idempotent.
    pub async fn close(&self) {
        if matches!(self.state(), ConnectionState::Open) {
            let _ = self.write_messages().await;
        }
        self.fail(
            Error::Communication(format!("connection #{} closed", self.id)),
            "closed",
        );
    }

    /// Close immediately, failing every queued and in-flight message.
    pub fn abort(&self) {
        self.fail(
            Error::Communication(format!("connection #{} aborted", self.id)),
            "aborted",
        );
    }

    /// Move to `Closing`, fail every message still on the connection and
    /// leave the pool. Idempotent.
    fn fail(&self, error: Error, reason: &str) {
        let drained: Vec<Arc<PendingCall>> = {
            let mut guard = self.queues.lock();
            let queues = &mut *guard;
            let mut state = self.state.lock();
            let first = matches!(*state, ConnectionState::Opening | ConnectionState::Open);
            if first {
                *state = ConnectionState::Closing;
            } else if queues.in_flight.is_empty() && queues.outbound.is_empty() {
                return;
            }
            drop(state);

            let drained: Vec<Arc<PendingCall>> = queues
                .in_flight
                .drain(..)
                .chain(queues.outbound.drain(..))
                .collect();
            self.load.store(0, Ordering::Release);
            drained
        };

        log_connection_closed(self.id, &self.destination, drained.len(), reason);

        for call in &drained {
            self.sink.deliver(call, Err(error.clone()));
        }

        self.closed.send_replace(true);

        if let Some(index) = self.index.upgrade() {
            index.remove(self.id);
        }
    }

    fn mark_closed(&self) {
        *self.state.lock() = ConnectionState::Closed;
    }

    async fn shutdown_writer(&self) {
        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        self.mark_closed();
    }

    async fn read_loop(self: Arc<Self>, read_half: ReadHalf<BoxedStream>) {
        let mut reader = BufReader::new(read_half);
        let mut closed = self.closed.subscribe();

        let (error, reason) = loop {
            let outcome = tokio::select! {
                _ = wait_closed(&mut closed) => return,
                outcome = self.read_next(&mut reader) => outcome,
            };

            match outcome {
                Ok(true) => continue,
                Ok(false) => {
                    break (
                        Error::Communication(format!("connection #{} closed after its last exchange", self.id)),
                        "end of exchanges",
                    )
                }
                Err(e) => break (e, "read failed"),
            }
        };

        self.fail(error, reason);
    }

    /// Read one response and deliver it. Returns whether to keep reading.
    async fn read_next(&self, reader: &mut BufReader<ReadHalf<BoxedStream>>) -> Result<bool> {
        if reader.fill_buf().await?.is_empty() {
            let pending = self.load() > 0;
            return if pending {
                Err(Error::Communication(format!("{} closed the connection", self.destination)))
            } else {
                Ok(false)
            };
        }

        let call = self
            .queues
            .lock()
            .in_flight
            .front()
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("unsolicited response from {}", self.destination)))?;

        let message = read_response(reader, call.method()).await?;

        {
            let mut queues = self.queues.lock();
            if let Some(front) = queues.in_flight.front() {
                if Arc::ptr_eq(front, &call) {
                    queues.in_flight.pop_front();
                    self.load.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        let keep_open = message.persistent && self.options.persistent;
        if !keep_open {
            self.persistent.store(false, Ordering::Release);
        }

        self.sink.deliver(&call, Ok(message.response));
        self.wake_writer.notify_one();

        Ok(keep_open)
    }

    async fn write_loop(self: Arc<Self>) {
        let mut closed = self.closed.subscribe();

        loop {
            tokio::select! {
                _ = wait_closed(&mut closed) => break,
                _ = self.wake_writer.notified() => {
                    if self.write_messages().await.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown_writer().await;
        log::trace!(
            "Connection #{} to {} released after {}ms",
            self.id,
            self.destination,
            elapsed_ms(self.created_at)
        );
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("secure", &self.secure)
            .field("state", &self.state())
            .field("load", &self.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::bridge::Completion;
    use crate::connector::codec::encode_request;
    use crate::connector::testing::DuplexFactory;
    use crate::models::{CallResult, ClientRequest};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    fn connection(depth: usize) -> Arc<Connection> {
        Arc::new(Connection::new(
            1,
            Destination::new("host1", 80),
            false,
            ConnectionOptions {
                pipeline_depth: depth,
                persistent: true,
            },
            Arc::new(ResponseSink::new()),
            Weak::new(),
        ))
    }

    fn call(path: &str, results: &mpsc::UnboundedSender<(String, CallResult)>) -> Arc<PendingCall> {
        let request = ClientRequest::get(&format!("http://host1{}", path)).unwrap();
        let wire = encode_request(&request, false, true);
        let tx = results.clone();
        let tag = path.to_string();
        let completion = Completion::callback(Box::new(move |result| {
            let _ = tx.send((tag, result));
        }));
        Arc::new(PendingCall::new(&request, Some(Destination::new("host1", 80)), wire, completion))
    }

    #[tokio::test]
    async fn test_messages_are_written_in_fifo_order() {
        let (factory, mut peers) = DuplexFactory::new(false);
        let conn = connection(3);
        let (tx, mut results) = mpsc::unbounded_channel();

        conn.enqueue(call("/1", &tx)).unwrap();
        conn.enqueue(call("/2", &tx)).unwrap();
        conn.enqueue(call("/3", &tx)).unwrap();
        conn.open(factory.as_ref()).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);

        let (_, mut server) = peers.recv().await.unwrap();
        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains("GET /3 ") {
            let mut buf = [0u8; 1024];
            let n = tokio::time::timeout(Duration::from_secs(5), server.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0);
            seen.extend_from_slice(&buf[..n]);
        }

        let wire = String::from_utf8_lossy(&seen).into_owned();
        let first = wire.find("GET /1 ").unwrap();
        let second = wire.find("GET /2 ").unwrap();
        let third = wire.find("GET /3 ").unwrap();
        assert!(first < second && second < third);

        for body in ["a", "b", "c"] {
            let response = format!("HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\n{}", body);
            server.write_all(response.as_bytes()).await.unwrap();
        }

        let mut order = Vec::new();
        for _ in 0..3 {
            let (tag, result) = results.recv().await.unwrap();
            order.push((tag, result.unwrap().text()));
        }
        assert_eq!(
            order,
            vec![
                ("/1".to_string(), "a".to_string()),
                ("/2".to_string(), "b".to_string()),
                ("/3".to_string(), "c".to_string()),
            ]
        );
        assert_eq!(conn.load(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_fails_every_in_flight_call() {
        let (factory, mut peers) = DuplexFactory::new(false);
        let conn = connection(2);
        let (tx, mut results) = mpsc::unbounded_channel();

        conn.open(factory.as_ref()).await.unwrap();
        conn.enqueue(call("/a", &tx)).unwrap();
        conn.enqueue(call("/b", &tx)).unwrap();

        let (_, mut server) = peers.recv().await.unwrap();
        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains("GET /b ") {
            let mut buf = [0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0);
            seen.extend_from_slice(&buf[..n]);
        }
        drop(server);

        for _ in 0..2 {
            let (_, result) = tokio::time::timeout(Duration::from_secs(5), results.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(result, Err(Error::Communication(_))));
        }
        assert!(!conn.accepts_more());
        assert!(conn.enqueue(call("/c", &tx)).is_err());
    }

    #[tokio::test]
    async fn test_oversized_response_fails_the_call_and_the_connection() {
        let (factory, mut peers) = DuplexFactory::new(false);
        let conn = connection(1);
        let (tx, mut results) = mpsc::unbounded_channel();

        conn.open(factory.as_ref()).await.unwrap();
        conn.enqueue(call("/huge", &tx)).unwrap();

        let (_, mut server) = peers.recv().await.unwrap();
        let mut buf = [0u8; 1024];
        let n = server.read(&mut buf).await.unwrap();
        assert!(n > 0);
        server
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 18446744073709551615\r\n\r\n")
            .await
            .unwrap();

        let (_, result) = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(!conn.accepts_more());
        assert_eq!(conn.load(), 0);
    }

    #[tokio::test]
    async fn test_abort_fails_queued_calls() {
        let (factory, _peers) = DuplexFactory::new(false);
        let conn = connection(1);
        let (tx, mut results) = mpsc::unbounded_channel();

        conn.open(factory.as_ref()).await.unwrap();
        conn.enqueue(call("/x", &tx)).unwrap();
        conn.enqueue(call("/y", &tx)).unwrap();
        conn.abort();
        conn.abort();

        let mut failed = 0;
        while let Ok(Some((_, result))) = tokio::time::timeout(Duration::from_millis(200), results.recv()).await {
            assert!(result.is_err());
            failed += 1;
        }
        assert_eq!(failed, 2);
        assert!(matches!(conn.state(), ConnectionState::Closing | ConnectionState::Closed));
    }

    #[tokio::test]
    async fn test_failed_open_reports_connectivity_error() {
        let factory = DuplexFactory::refusing();
        let conn = connection(1);
        let (tx, mut results) = mpsc::unbounded_channel();
        conn.enqueue(call("/queued", &tx)).unwrap();

        let err = conn.open(factory.as_ref()).await.unwrap_err();
        assert!(matches!(err, Error::Connectivity(_)));
        assert_eq!(conn.state(), ConnectionState::Closed);

        let (_, result) = results.recv().await.unwrap();
        assert!(matches!(result, Err(Error::Connectivity(_))));
    }

    #[tokio::test]
    async fn test_busy_connection_cannot_enqueue() {
        let (factory, _peers) = DuplexFactory::new(false);
        let conn = connection(1);
        let (tx, _results) = mpsc::unbounded_channel();

        assert!(!conn.can_enqueue());
        conn.open(factory.as_ref()).await.unwrap();
        assert!(conn.can_enqueue());

        conn.enqueue(call("/busy", &tx)).unwrap();
        assert!(!conn.can_enqueue());
        assert!(conn.accepts_more());
    }
}
