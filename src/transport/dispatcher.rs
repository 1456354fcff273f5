//! Client-side dispatch.
//!
//! # Responsibilities
//! - Drive a request through disruption, query tunneling, codec selection,
//!   pool checkout, and the wire exchange
//! - Enforce the request timeout on the response head and the streaming
//!   idle timeout on the response body
//! - Release connections back to the pool only once both bodies are terminal
//!
//! # Design Decisions
//! - The request timeout covers up to the response head; bodies that stream
//!   afterwards are governed by the idle timeout instead
//! - A timed-out or shut-down exchange abandons the connection rather than
//!   waiting for its bodies, so a stuck peer cannot pin a pool slot

use std::sync::Arc;

use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING};
use http::HeaderValue;
use tokio::time::Instant;

use crate::codec::{self, Codec};
use crate::config::TransportConfig;
use crate::disrupt;
use crate::error::Error;
use crate::message::{RequestContext, RestRequest, RestResponse, StreamRequest, StreamResponse};
use crate::stream::buffered::{byte_stream, read_full};
use crate::transport::connection::ConnectionFactory;
use crate::transport::monitor::{monitor_idle, ExchangeTracker};
use crate::transport::pool::ConnectionPool;
use crate::transport::Shutdown;
use crate::tunnel;

/// Streaming transport client.
pub struct Client {
    config: Arc<TransportConfig>,
    pool: Arc<ConnectionPool>,
    shutdown: Shutdown,
}

impl Client {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: TransportConfig) -> Self {
        let config = Arc::new(config);
        let pool = ConnectionPool::new(factory, config.pool.clone());
        Client {
            config,
            pool,
            shutdown: Shutdown::new(),
        }
    }

    /// Establish the configured minimum of connections up front.
    pub async fn start(&self) {
        self.pool.prewarm().await;
    }

    /// Dispatch a streaming request.
    pub async fn send(
        &self,
        request: StreamRequest,
        ctx: RequestContext,
    ) -> Result<StreamResponse, Error> {
        if self.pool.is_shutting_down() {
            return Err(Error::Shutdown);
        }
        let issued_at = Instant::now();
        let request_timeout = self.config.timeouts.request();

        if let Some(directive) = &ctx.disrupt {
            disrupt::apply(directive, issued_at, request_timeout).await?;
        }

        let mut request = self.prepare(request, &ctx)?;
        request.headers.insert(
            ACCEPT_ENCODING,
            accept_encoding_value(&self.config.encodings.response)?,
        );

        let pooled = self.pool.acquire().await?;
        let conn = Arc::clone(&pooled.conn);
        let conn_id = pooled.id;
        let pool = Arc::clone(&self.pool);
        let tracker = ExchangeTracker::new(move |reusable| pool.release(pooled, reusable));
        // Once the tracker owns the checked-out connection, every exit
        // from this function must either run the exchange to terminal
        // state or abandon; an early return would strand the pool slot.
        if let Err(err) = request.body.add_observer(tracker.request_observer()) {
            tracker.abandon();
            return Err(err);
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let response = tokio::select! {
            outcome = tokio::time::timeout(request_timeout, conn.exchange(request)) => {
                match outcome {
                    Ok(Ok(response)) => response,
                    Ok(Err(err)) => {
                        tracing::debug!(id = %conn_id, error = %err, "exchange failed");
                        tracker.abandon();
                        return Err(err);
                    }
                    Err(_) => {
                        tracing::warn!(id = %conn_id, ?request_timeout, "request timed out");
                        tracker.abandon();
                        return Err(Error::RequestTimeout {
                            timeout: request_timeout,
                        });
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracker.abandon();
                return Err(Error::Shutdown);
            }
        };

        match self.finish(response, &tracker) {
            Ok(response) => Ok(response),
            Err(err) => {
                tracker.abandon();
                Err(err)
            }
        }
    }

    /// Dispatch a fully buffered request and buffer the response.
    pub async fn send_rest(
        &self,
        request: RestRequest,
        ctx: RequestContext,
    ) -> Result<RestResponse, Error> {
        let request = tunnel::encode(request, &ctx, self.config.limits.query_tunnel_threshold)?;
        let mut streamed = StreamRequest::new(
            request.method,
            request.uri,
            byte_stream(request.body),
        );
        streamed.headers = request.headers;

        let response = self.send(streamed, ctx).await?;
        let body = read_full(&response.body, Some(self.config.limits.max_response_bytes)).await?;
        Ok(RestResponse {
            status: response.status,
            headers: response.headers,
            body,
        })
    }

    /// Trigger shutdown: fail in-flight sends and drain the pool.
    pub async fn shutdown(&self) {
        tracing::info!("client shutdown requested");
        self.shutdown.trigger();
        self.pool.shutdown(self.config.timeouts.shutdown()).await;
    }

    /// Apply query tunneling and request-body compression before checkout.
    fn prepare(
        &self,
        request: StreamRequest,
        ctx: &RequestContext,
    ) -> Result<StreamRequest, Error> {
        let mut request = self.tunnel_if_needed(request, ctx)?;

        if let Some(name) = &self.config.encodings.request_content_encoding {
            let codec = Codec::from_name(name)
                .ok_or_else(|| Error::Codec(format!("unsupported request encoding '{name}'")))?;
            if codec != Codec::Identity {
                let compressed = codec::deflate(&request.body, codec)?;
                request.body = compressed;
                request
                    .headers
                    .insert(CONTENT_ENCODING, HeaderValue::from_static(codec.name()));
            }
        }
        Ok(request)
    }

    /// An oversized (or forced) GET query moves into a POST body. The
    /// original body stream is dropped; tunneling only applies to GETs,
    /// whose bodies are empty.
    fn tunnel_if_needed(
        &self,
        request: StreamRequest,
        ctx: &RequestContext,
    ) -> Result<StreamRequest, Error> {
        let threshold = self.config.limits.query_tunnel_threshold;
        if !tunnel::should_tunnel(&request.method, &request.uri, ctx.force_query_tunnel, threshold)
        {
            return Ok(request);
        }
        let mut head = RestRequest::get(request.uri);
        head.headers = request.headers;
        let encoded = tunnel::encode(head, ctx, threshold)?;
        tracing::debug!(uri = %encoded.uri, "query tunneled to request body");
        let mut tunneled =
            StreamRequest::new(encoded.method, encoded.uri, byte_stream(encoded.body));
        tunneled.headers = encoded.headers;
        Ok(tunneled)
    }

    /// Wire up response-side monitoring and decompression.
    fn finish(
        &self,
        mut response: StreamResponse,
        tracker: &Arc<ExchangeTracker>,
    ) -> Result<StreamResponse, Error> {
        response.body.add_observer(tracker.response_observer())?;

        let monitored = monitor_idle(&response.body, self.config.timeouts.stream_idle())?;
        response.body = monitored;

        if let Some(value) = response.headers.get(CONTENT_ENCODING).cloned() {
            let name = value.to_str().unwrap_or_default();
            match Codec::from_name(name) {
                Some(Codec::Identity) => {
                    response.headers.remove(CONTENT_ENCODING);
                }
                Some(codec) => {
                    response.body = codec::inflate(&response.body, codec)?;
                    response.headers.remove(CONTENT_ENCODING);
                }
                None => {
                    // Cannot decode; hand the body through as received.
                    tracing::warn!(encoding = %name, "unrecognized response content-encoding");
                }
            }
        }
        Ok(response)
    }
}

fn accept_encoding_value(names: &[String]) -> Result<HeaderValue, Error> {
    let joined = names.join(", ");
    let value = if joined.is_empty() {
        HeaderValue::from_static("identity")
    } else {
        HeaderValue::from_str(&joined)
            .map_err(|_| Error::Codec(format!("invalid accept-encoding list '{joined}'")))?
    };
    Ok(value)
}
