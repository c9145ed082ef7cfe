//! Client call dispatcher: synchronous and asynchronous request handling

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::connector::bridge::{Completion, ResponseSink};
use crate::connector::call::PendingCall;
use crate::connector::codec::encode_request;
use crate::connector::pool::ConnectionPool;
use crate::error::{Error, Result};
use crate::models::{CallResult, ClientRequest, Destination};
use crate::{log_debug, log_warning};

/// What `handle` hands back to its caller
#[derive(Debug)]
pub enum CallOutcome {
    /// Synchronous mode: the call finished, failed or timed out
    Completed(CallResult),
    /// Asynchronous mode: the callback will receive the result
    Pending,
}

impl CallOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, CallOutcome::Pending)
    }

    /// The result of a synchronous call, None for an asynchronous one
    pub fn into_result(self) -> Option<CallResult> {
        match self {
            CallOutcome::Completed(result) => Some(result),
            CallOutcome::Pending => None,
        }
    }
}

pub struct ClientDispatcher {
    pool: Arc<ConnectionPool>,
    sink: Arc<ResponseSink>,
    response_timeout: Duration,
    persistent: bool,
}

impl ClientDispatcher {
    pub fn new(pool: Arc<ConnectionPool>, sink: Arc<ResponseSink>, response_timeout: Duration) -> Self {
        let persistent = pool.settings().connection.persistent;
        Self {
            pool,
            sink,
            response_timeout,
            persistent,
        }
    }

    /// Dispatch a request.
    ///
    /// Without a callback the request is sent from the caller's task, which
    /// then parks until the result arrives or the response timeout fires.
    /// With one, sending moves to a spawned task, this returns at once and
    /// the callback is invoked later from the connection's tasks.
    pub async fn handle(self: &Arc<Self>, mut request: ClientRequest) -> CallOutcome {
        let destination = self.pool.resolve_destination(&request.url);
        let wire = encode_request(&request, self.pool.settings().proxy.is_some(), self.persistent);

        match request.take_callback() {
            Some(callback) => {
                let completion = Completion::callback(callback);
                let call = Arc::new(PendingCall::new(&request, destination.as_ref().ok().cloned(), wire, completion));
                log_debug!("Dispatching call {} {} {} (async)", call.id(), call.method(), call.url());

                tokio::spawn(self.clone().handle_outbound(call, destination));
                CallOutcome::Pending
            }
            None => {
                let (completion, waiter) = Completion::latch();
                let call = Arc::new(PendingCall::new(&request, destination.as_ref().ok().cloned(), wire, completion));
                log_debug!("Dispatching call {} {} {}", call.id(), call.method(), call.url());

                let deadline = Instant::now() + self.response_timeout;

                // Send on this task; only a send still running at the
                // deadline moves to its own task
                let mut outbound = Box::pin(self.clone().handle_outbound(call.clone(), destination));
                tokio::select! {
                    _ = &mut outbound => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        tokio::spawn(outbound);
                    }
                }

                let remaining = deadline.saturating_duration_since(Instant::now());
                let result = match waiter.wait(call.completion(), remaining).await {
                    Err(Error::Timeout(_)) => Err(Error::Timeout(self.response_timeout)),
                    other => other,
                };
                if let Err(Error::Timeout(limit)) = &result {
                    self.sink.record_timeout();
                    log_warning!("Call {} to {} timed out after {:?}", call.id(), call.url(), limit);
                }
                CallOutcome::Completed(result)
            }
        }
    }

    /// Sending path: pick a connection, bind the call to it and queue it.
    /// Every failure is routed through the same release as a real response.
    async fn handle_outbound(self: Arc<Self>, call: Arc<PendingCall>, destination: Result<Destination>) {
        let destination = match destination {
            Ok(destination) => destination,
            Err(e) => {
                self.sink.deliver(&call, Err(e));
                return;
            }
        };

        if call.abort_handle().is_aborted() {
            self.sink.deliver(&call, Err(Error::Aborted));
            return;
        }

        let connection = match self.pool.get_best_connection(&destination, call.is_confidential()).await {
            Ok(Some(connection)) => connection,
            Ok(None) => {
                self.sink.deliver(&call, Err(Error::CapacityExhausted(destination.to_string())));
                return;
            }
            Err(e) => {
                self.sink.deliver(&call, Err(e));
                return;
            }
        };

        if !call.abort_handle().attach(&connection) {
            self.sink.deliver(&call, Err(Error::Aborted));
            return;
        }

        if let Err(e) = connection.enqueue(call.clone()) {
            self.sink.deliver(&call, Err(e));
            return;
        }

        if !call.expecting_response() {
            // Write right away instead of waiting for the writer task
            if let Err(e) = connection.write_messages().await {
                log_debug!("Inline write of call {} failed: {}", call.id(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::connection::ConnectionOptions;
    use crate::connector::pool::PoolSettings;
    use crate::connector::socket_factory::SocketFactories;
    use crate::connector::testing::{serve_peers, DuplexFactory, HangingFactory, Reply};
    use hyper::StatusCode;
    use tokio::io::AsyncReadExt;
    use tokio::sync::oneshot;

    fn dispatcher(reply: Reply, timeout: Duration) -> (Arc<ClientDispatcher>, Arc<DuplexFactory>) {
        let (factory, peers) = DuplexFactory::new(false);
        serve_peers(peers, reply);

        let sink = Arc::new(ResponseSink::new());
        let settings = PoolSettings {
            max_total_connections: None,
            max_connections_per_destination: Some(1),
            proxy: None,
            connection: ConnectionOptions::default(),
        };
        let factories = SocketFactories {
            plain: factory.clone(),
            secure: factory.clone(),
        };
        let pool = Arc::new(ConnectionPool::new(settings, factories, sink.clone()));
        (Arc::new(ClientDispatcher::new(pool, sink, timeout)), factory)
    }

    #[tokio::test]
    async fn test_synchronous_call_completes() {
        let (dispatcher, _) = dispatcher(Reply::Ok("hello"), Duration::from_secs(5));
        let request = ClientRequest::get("http://host1/greeting").unwrap();

        let response = dispatcher.handle(request).await.into_result().unwrap().unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "hello");
        assert_eq!(dispatcher.sink.completed(), 1);
    }

    #[tokio::test]
    async fn test_asynchronous_call_invokes_callback() {
        let (dispatcher, _) = dispatcher(Reply::Ok("later"), Duration::from_secs(5));
        let (tx, rx) = oneshot::channel();
        let request = ClientRequest::get("http://host1/")
            .unwrap()
            .on_response(move |result| {
                let _ = tx.send(result);
            });

        let outcome = dispatcher.handle(request).await;
        assert!(outcome.is_pending());

        let result = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(result.unwrap().text(), "later");
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (dispatcher, _) = dispatcher(Reply::Silent, Duration::from_millis(50));
        let request = ClientRequest::get("http://host1/slow").unwrap();

        let result = dispatcher.handle(request).await.into_result().unwrap();
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(dispatcher.sink.timed_out(), 1);
    }

    #[tokio::test]
    async fn test_aborted_request_never_connects() {
        let (dispatcher, factory) = dispatcher(Reply::Ok("unused"), Duration::from_secs(5));
        let request = ClientRequest::get("http://host1/").unwrap();
        request.abort_handle().abort();

        let result = dispatcher.handle(request).await.into_result().unwrap();
        assert_eq!(result.unwrap_err(), Error::Aborted);
        assert_eq!(factory.connects(), 0);
    }

    #[tokio::test]
    async fn test_fire_and_forget_returns_once_written() {
        let (dispatcher, _) = dispatcher(Reply::Silent, Duration::from_secs(5));
        let request = ClientRequest::new(hyper::Method::POST, "http://host1/events")
            .unwrap()
            .with_body("event")
            .without_response();

        let response = dispatcher.handle(request).await.into_result().unwrap().unwrap();
        assert_eq!(response.status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_abort_in_flight_fails_the_caller() {
        let (dispatcher, _) = dispatcher(Reply::Silent, Duration::from_secs(5));
        let request = ClientRequest::get("http://host1/hang").unwrap();
        let abort = request.abort_handle();

        let waiting = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.handle(request).await }
        });

        // Abort once the call is bound to its connection
        while dispatcher.pool.open_connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        abort.abort();

        let result = waiting.await.unwrap().into_result().unwrap();
        assert!(matches!(result, Err(Error::Communication(_)) | Err(Error::Aborted)));
    }

    #[tokio::test]
    async fn test_connect_outliving_the_timeout_keeps_running() {
        let hanging = Arc::new(HangingFactory);
        let sink = Arc::new(ResponseSink::new());
        let settings = PoolSettings {
            max_total_connections: None,
            max_connections_per_destination: None,
            proxy: None,
            connection: ConnectionOptions::default(),
        };
        let factories = SocketFactories {
            plain: hanging.clone(),
            secure: hanging,
        };
        let pool = Arc::new(ConnectionPool::new(settings, factories, sink.clone()));
        let dispatcher = Arc::new(ClientDispatcher::new(pool.clone(), sink, Duration::from_millis(30)));

        let result = dispatcher
            .handle(ClientRequest::get("http://host1/").unwrap())
            .await
            .into_result()
            .unwrap();
        assert_eq!(result.unwrap_err(), Error::Timeout(Duration::from_millis(30)));

        // The connect moved to its own task instead of being abandoned
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(dispatcher.sink.timed_out(), 1);
    }

    #[tokio::test]
    async fn test_fire_and_forget_is_written_before_returning() {
        let (factory, mut peers) = DuplexFactory::new(false);
        let sink = Arc::new(ResponseSink::new());
        let settings = PoolSettings {
            max_total_connections: None,
            max_connections_per_destination: None,
            proxy: None,
            connection: ConnectionOptions::default(),
        };
        let factories = SocketFactories {
            plain: factory.clone(),
            secure: factory,
        };
        let pool = Arc::new(ConnectionPool::new(settings, factories, sink.clone()));
        let dispatcher = Arc::new(ClientDispatcher::new(pool, sink, Duration::from_secs(5)));

        let request = ClientRequest::new(hyper::Method::POST, "http://host1/events")
            .unwrap()
            .with_body("event")
            .without_response();
        let response = dispatcher.handle(request).await.into_result().unwrap().unwrap();
        assert_eq!(response.status, StatusCode::ACCEPTED);

        let (_, mut server) = peers.try_recv().unwrap();
        let mut buf = vec![0u8; 1024];
        let n = server.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("POST /events HTTP/1.1\r\n"));
    }
}
