//! Client dispatch: pooling, timeouts, tunneling, disruption, shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode, Uri};

use flowgate::disrupt::DisruptContext;
use flowgate::stream::buffered::{byte_stream, read_full};
use flowgate::stream::{EntityStream, WriteHandle, Writer};
use flowgate::transport::{BoxFuture, ConnectionFactory, ConnectionPool};
use flowgate::{
    Error, RequestContext, RestRequest, StreamHandler, StreamRequest, StreamResponse,
    TransportConfig,
};

mod common;

use common::{loopback_client, loopback_factory, recording_reader, EchoHandler};

#[tokio::test]
async fn rest_round_trip_echoes_the_body() {
    let (client, factory) = loopback_client(Arc::new(EchoHandler), TransportConfig::default());
    client.start().await;

    let response = client
        .send_rest(
            RestRequest::post(
                Uri::from_static("http://localhost/echo"),
                Bytes::from_static(b"ping"),
            ),
            RequestContext::default(),
        )
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.as_ref(), b"ping");
    assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sequential_requests_reuse_one_connection() {
    let (client, factory) = loopback_client(Arc::new(EchoHandler), TransportConfig::default());

    for i in 0..5u8 {
        let response = client
            .send_rest(
                RestRequest::post(
                    Uri::from_static("http://localhost/echo"),
                    Bytes::from(vec![i; 8]),
                ),
                RequestContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(response.body.as_ref(), vec![i; 8].as_slice());
    }
    assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
}

/// Handler that records what it saw and echoes the query back.
struct QueryInspector {
    seen: Arc<Mutex<Vec<(Method, String, bool)>>>,
}

impl StreamHandler for QueryInspector {
    fn handle(
        &self,
        request: StreamRequest,
        ctx: RequestContext,
    ) -> BoxFuture<'static, Result<StreamResponse, Error>> {
        let seen = Arc::clone(&self.seen);
        Box::pin(async move {
            let query = request.uri.query().unwrap_or_default().to_string();
            seen.lock()
                .unwrap()
                .push((request.method.clone(), query.clone(), ctx.is_query_tunneled));
            Ok(StreamResponse::new(
                StatusCode::OK,
                byte_stream(Bytes::from(query)),
            ))
        })
    }
}

#[tokio::test]
async fn oversized_get_query_tunnels_and_is_restored() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(QueryInspector {
        seen: Arc::clone(&seen),
    });
    let (client, _factory) = loopback_client(handler, TransportConfig::default());

    let long_value = "v".repeat(5000);
    let uri: Uri = format!("http://localhost/resource?key={long_value}")
        .parse()
        .unwrap();
    let response = client
        .send_rest(RestRequest::get(uri), RequestContext::default())
        .await
        .unwrap();

    let records = seen.lock().unwrap();
    let (method, query, tunneled) = &records[0];
    assert_eq!(*method, Method::GET);
    assert_eq!(*query, format!("key={long_value}"));
    assert!(*tunneled, "handler should see the un-tunneled request flagged");
    assert_eq!(response.body.as_ref(), query.as_bytes());
}

#[tokio::test]
async fn short_get_query_is_not_tunneled() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(QueryInspector {
        seen: Arc::clone(&seen),
    });
    let (client, _factory) = loopback_client(handler, TransportConfig::default());

    client
        .send_rest(
            RestRequest::get(Uri::from_static("http://localhost/resource?key=v")),
            RequestContext::default(),
        )
        .await
        .unwrap();

    let records = seen.lock().unwrap();
    assert_eq!(records[0], (Method::GET, "key=v".to_string(), false));
}

#[tokio::test]
async fn forced_tunnel_applies_below_the_threshold() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(QueryInspector {
        seen: Arc::clone(&seen),
    });
    let (client, _factory) = loopback_client(handler, TransportConfig::default());

    let ctx = RequestContext {
        force_query_tunnel: true,
        ..RequestContext::default()
    };
    client
        .send_rest(
            RestRequest::get(Uri::from_static("http://localhost/resource?key=v")),
            ctx,
        )
        .await
        .unwrap();

    let records = seen.lock().unwrap();
    assert_eq!(records[0], (Method::GET, "key=v".to_string(), true));
}

/// Handler that answers after a fixed delay.
struct DelayedHandler {
    delay: Duration,
}

impl StreamHandler for DelayedHandler {
    fn handle(
        &self,
        request: StreamRequest,
        _ctx: RequestContext,
    ) -> BoxFuture<'static, Result<StreamResponse, Error>> {
        let delay = self.delay;
        Box::pin(async move {
            let _ = read_full(&request.body, None).await;
            tokio::time::sleep(delay).await;
            Ok(StreamResponse::new(
                StatusCode::OK,
                byte_stream(Bytes::from_static(b"late")),
            ))
        })
    }
}

#[tokio::test]
async fn slow_response_head_times_out_with_the_configured_value() {
    let mut config = TransportConfig::default();
    config.timeouts.request_ms = 500;
    let (client, _factory) = loopback_client(
        Arc::new(DelayedHandler {
            delay: Duration::from_millis(600),
        }),
        config,
    );

    let err = client
        .send_rest(
            RestRequest::get(Uri::from_static("http://localhost/slow")),
            RequestContext::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(
        err,
        Error::RequestTimeout {
            timeout: Duration::from_millis(500)
        }
    );
}

#[tokio::test]
async fn disrupt_timeout_is_indistinguishable_from_a_real_one() {
    let mut config = TransportConfig::default();
    config.timeouts.request_ms = 100;
    let (client, factory) = loopback_client(Arc::new(EchoHandler), config);

    let ctx = RequestContext {
        disrupt: Some(DisruptContext::Timeout),
        ..RequestContext::default()
    };
    let started = tokio::time::Instant::now();
    let err = client
        .send_rest(
            RestRequest::get(Uri::from_static("http://localhost/any")),
            ctx,
        )
        .await
        .unwrap_err();

    assert_eq!(
        err,
        Error::RequestTimeout {
            timeout: Duration::from_millis(100)
        }
    );
    assert!(started.elapsed() >= Duration::from_millis(100));
    // The disrupted call never reached the wire.
    assert_eq!(factory.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disrupt_error_fails_without_io() {
    let (client, factory) = loopback_client(Arc::new(EchoHandler), TransportConfig::default());

    let ctx = RequestContext {
        disrupt: Some(DisruptContext::Error("injected fault".to_string())),
        ..RequestContext::default()
    };
    let err = client
        .send_rest(
            RestRequest::get(Uri::from_static("http://localhost/any")),
            ctx,
        )
        .await
        .unwrap_err();

    assert_eq!(err, Error::Disrupted("injected fault".to_string()));
    assert_eq!(factory.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disrupt_minimum_delay_pads_the_call() {
    let (client, _factory) = loopback_client(Arc::new(EchoHandler), TransportConfig::default());

    let ctx = RequestContext {
        disrupt: Some(DisruptContext::MinimumDelay(Duration::from_millis(150))),
        ..RequestContext::default()
    };
    let started = tokio::time::Instant::now();
    client
        .send_rest(
            RestRequest::get(Uri::from_static("http://localhost/any")),
            ctx,
        )
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));
}

/// Body writer that emits one chunk and then stalls forever.
struct StallingWriter {
    handle: Option<WriteHandle>,
    sent: bool,
}

impl Writer for StallingWriter {
    fn on_init(&mut self, handle: WriteHandle) {
        self.handle = Some(handle);
    }

    fn on_write_possible(&mut self) {
        if self.sent {
            return;
        }
        if let Some(wh) = &self.handle {
            let _ = wh.write(Bytes::from_static(b"head"));
            self.sent = true;
        }
    }

    fn on_abort(&mut self, _err: Error) {}
}

/// Handler whose response body never terminates.
struct StallingHandler;

impl StreamHandler for StallingHandler {
    fn handle(
        &self,
        request: StreamRequest,
        _ctx: RequestContext,
    ) -> BoxFuture<'static, Result<StreamResponse, Error>> {
        Box::pin(async move {
            let _ = read_full(&request.body, None).await;
            Ok(StreamResponse::new(
                StatusCode::OK,
                EntityStream::new(StallingWriter {
                    handle: None,
                    sent: false,
                }),
            ))
        })
    }
}

#[tokio::test]
async fn unfinished_response_body_pins_the_connection() {
    let mut config = TransportConfig::default();
    config.pool.max_size = 1;
    config.pool.wait_timeout_ms = 200;
    // No compression so the stalled body passes straight through.
    config.encodings.response = vec!["identity".to_string()];
    let (client, factory) = loopback_client(Arc::new(StallingHandler), config);

    let first = client
        .send(
            StreamRequest::new(
                Method::GET,
                Uri::from_static("http://localhost/stall"),
                byte_stream(Bytes::new()),
            ),
            RequestContext::default(),
        )
        .await
        .unwrap();
    let (reader, record) = recording_reader(4);
    first.body.set_reader(reader).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(record.body(), b"head");

    // The only connection is still carrying the first exchange.
    let err = client
        .send(
            StreamRequest::new(
                Method::GET,
                Uri::from_static("http://localhost/stall"),
                byte_stream(Bytes::new()),
            ),
            RequestContext::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }), "got {err:?}");

    // Cancelling the stuck body frees the slot (on a fresh connection,
    // since the old one cannot be trusted).
    record.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let third = client
        .send(
            StreamRequest::new(
                Method::GET,
                Uri::from_static("http://localhost/stall"),
                byte_stream(Bytes::new()),
            ),
            RequestContext::default(),
        )
        .await
        .unwrap();
    drop(third);
    assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stalled_producer_trips_the_idle_timeout() {
    let mut config = TransportConfig::default();
    config.timeouts.stream_idle_ms = 200;
    config.encodings.response = vec!["identity".to_string()];
    let (client, _factory) = loopback_client(Arc::new(StallingHandler), config);

    let response = client
        .send(
            StreamRequest::new(
                Method::GET,
                Uri::from_static("http://localhost/stall"),
                byte_stream(Bytes::new()),
            ),
            RequestContext::default(),
        )
        .await
        .unwrap();

    let (reader, record) = recording_reader(4);
    response.body.set_reader(reader).unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(record.body(), b"head");
    let errors = record.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0],
        Error::StreamTimeout {
            idle: Duration::from_millis(200)
        }
    );
}

#[tokio::test]
async fn shutdown_fails_in_flight_and_subsequent_sends() {
    let mut config = TransportConfig::default();
    config.timeouts.shutdown_ms = 1000;
    let (client, _factory) = loopback_client(
        Arc::new(DelayedHandler {
            delay: Duration::from_secs(5),
        }),
        config,
    );

    let in_flight = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .send_rest(
                    RestRequest::get(Uri::from_static("http://localhost/slow")),
                    RequestContext::default(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.shutdown().await;

    assert_eq!(in_flight.await.unwrap().unwrap_err(), Error::Shutdown);
    let err = client
        .send_rest(
            RestRequest::get(Uri::from_static("http://localhost/any")),
            RequestContext::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, Error::Shutdown);
}

/// Handler that answers without ever touching the request body.
struct BodyIgnoringHandler;

impl StreamHandler for BodyIgnoringHandler {
    fn handle(
        &self,
        _request: StreamRequest,
        _ctx: RequestContext,
    ) -> BoxFuture<'static, Result<StreamResponse, Error>> {
        Box::pin(async move {
            Ok(StreamResponse::new(
                StatusCode::OK,
                byte_stream(Bytes::from_static(b"ok")),
            ))
        })
    }
}

#[tokio::test]
async fn unread_request_body_still_frees_the_pool_slot() {
    let mut config = TransportConfig::default();
    config.pool.max_size = 1;
    config.pool.wait_timeout_ms = 300;
    config.encodings.response = vec!["identity".to_string()];
    let (client, factory) = loopback_client(Arc::new(BodyIgnoringHandler), config);

    for _ in 0..2 {
        let response = client
            .send_rest(
                RestRequest::post(
                    Uri::from_static("http://localhost/sink"),
                    Bytes::from(vec![7u8; 4096]),
                ),
                RequestContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(response.body.as_ref(), b"ok");
    }
    // The abandoned request body makes each connection untrustworthy,
    // so the slot is recycled rather than reused.
    assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn released_connection_skips_dead_waiters() {
    let mut config = TransportConfig::default();
    config.pool.max_size = 1;
    config.pool.wait_timeout_ms = 5_000;
    let factory = loopback_factory(Arc::new(EchoHandler), config.clone());
    let pool = ConnectionPool::new(factory as Arc<dyn ConnectionFactory>, config.pool.clone());

    let held = pool.acquire().await.unwrap();

    let abandoned = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    abandoned.abort();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let waiting = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.release(held, true);
    // The released connection must reach the live waiter, not park idle
    // behind the earlier abandoned one.
    let got = tokio::time::timeout(Duration::from_millis(500), waiting)
        .await
        .expect("waiter starved despite an available connection")
        .unwrap()
        .unwrap();
    pool.release(got, true);
}

#[tokio::test]
async fn failed_observer_attach_frees_the_slot() {
    let mut config = TransportConfig::default();
    config.pool.max_size = 1;
    config.pool.wait_timeout_ms = 300;
    let (client, factory) = loopback_client(Arc::new(EchoHandler), config);

    let request = StreamRequest::new(
        Method::GET,
        Uri::from_static("http://localhost/any"),
        byte_stream(Bytes::new()),
    );
    let (reader, _record) = recording_reader(1);
    request.body.set_reader(reader).unwrap();

    let err = client
        .send(request, RequestContext::default())
        .await
        .unwrap_err();
    assert_eq!(err, Error::AlreadyAttached);

    // The checked-out connection was surrendered, so a well-formed call
    // still goes through.
    let response = client
        .send_rest(
            RestRequest::get(Uri::from_static("http://localhost/any")),
            RequestContext::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
}

/// Handler that panics; the dispatcher must still answer.
struct PanickingHandler;

impl StreamHandler for PanickingHandler {
    fn handle(
        &self,
        _request: StreamRequest,
        _ctx: RequestContext,
    ) -> BoxFuture<'static, Result<StreamResponse, Error>> {
        Box::pin(async move { panic!("handler exploded") })
    }
}

#[tokio::test]
async fn handler_panic_becomes_a_500_response() {
    let (client, _factory) =
        loopback_client(Arc::new(PanickingHandler), TransportConfig::default());

    let response = client
        .send_rest(
            RestRequest::get(Uri::from_static("http://localhost/boom")),
            RequestContext::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
}

/// Handler that panics before it even returns a future.
struct EagerPanicHandler;

impl StreamHandler for EagerPanicHandler {
    fn handle(
        &self,
        _request: StreamRequest,
        _ctx: RequestContext,
    ) -> BoxFuture<'static, Result<StreamResponse, Error>> {
        panic!("refused to build a response");
    }
}

#[tokio::test]
async fn panic_while_building_the_response_becomes_a_500() {
    let (client, _factory) =
        loopback_client(Arc::new(EagerPanicHandler), TransportConfig::default());

    let response = client
        .send_rest(
            RestRequest::get(Uri::from_static("http://localhost/boom")),
            RequestContext::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn oversized_buffered_response_is_rejected() {
    let mut config = TransportConfig::default();
    config.limits.max_response_bytes = 1024;
    config.encodings.response = vec!["identity".to_string()];
    let (client, _factory) = loopback_client(Arc::new(EchoHandler), config);

    let err = client
        .send_rest(
            RestRequest::post(
                Uri::from_static("http://localhost/echo"),
                Bytes::from(vec![0u8; 4096]),
            ),
            RequestContext::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, Error::ResponseTooLarge { limit: 1024 });
}
