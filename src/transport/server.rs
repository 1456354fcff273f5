//! Server-side dispatch.
//!
//! # Responsibilities
//! - Negotiate the response coding from `Accept-Encoding`
//! - Decompress request bodies and un-tunnel query-tunneled requests
//! - Invoke the application handler, containing its panics
//! - Compress responses above the configured threshold
//!
//! # Design Decisions
//! - `dispatch` is infallible: every failure becomes a well-formed response
//!   on the same connection, so the wire never sees a half-exchange
//! - Error responses are always identity-coded
//! - Bodies under the threshold skip compression entirely; the decision is
//!   made by buffering at most `threshold` bytes, never the whole body

use std::sync::Arc;

use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderValue, StatusCode};

use crate::codec::{self, Codec};
use crate::config::TransportConfig;
use crate::error::Error;
use crate::message::{RequestContext, RestRequest, StreamRequest, StreamResponse};
use crate::stream::bridge::{transform_stream, PrependTransform};
use crate::stream::buffered::{buffer_upto, byte_stream, chunk_stream, read_full, Buffered};
use crate::transport::connection::BoxFuture;
use crate::tunnel;

/// Application-level request handler.
pub trait StreamHandler: Send + Sync + 'static {
    fn handle(
        &self,
        request: StreamRequest,
        ctx: RequestContext,
    ) -> BoxFuture<'static, Result<StreamResponse, Error>>;
}

/// Server-side counterpart of the client dispatcher.
pub struct ServerDispatcher {
    handler: Arc<dyn StreamHandler>,
    config: Arc<TransportConfig>,
    supported: Vec<Codec>,
}

impl ServerDispatcher {
    pub fn new(handler: Arc<dyn StreamHandler>, config: TransportConfig) -> Self {
        let supported = config
            .encodings
            .response
            .iter()
            .filter_map(|name| Codec::from_name(name))
            .collect();
        ServerDispatcher {
            handler,
            config: Arc::new(config),
            supported,
        }
    }

    /// Process one exchange. Always produces a response.
    pub async fn dispatch(&self, request: StreamRequest) -> StreamResponse {
        let accept = request
            .headers
            .get(ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let response_codec = match codec::negotiate(accept.as_deref(), &self.supported) {
            Ok(codec) => codec,
            Err(err) => {
                tracing::debug!(error = %err, "no acceptable response coding");
                return error_response(StatusCode::NOT_ACCEPTABLE, &err);
            }
        };

        let request = match self.decompress_request(request) {
            Ok(request) => request,
            Err(err) => {
                return error_response(StatusCode::UNSUPPORTED_MEDIA_TYPE, &err);
            }
        };

        let mut ctx = RequestContext::default();
        let request = if request.headers.contains_key(tunnel::METHOD_OVERRIDE) {
            match self.untunnel(request, &mut ctx).await {
                Ok(request) => request,
                Err(err) => {
                    tracing::debug!(error = %err, "failed to decode tunneled query");
                    return error_response(StatusCode::BAD_REQUEST, &err);
                }
            }
        } else {
            request
        };

        // The handler runs entirely inside the spawned task so that a
        // panic thrown while building the future is contained too, not
        // just one from polling it.
        let handler = Arc::clone(&self.handler);
        let invocation = tokio::spawn(async move { handler.handle(request, ctx).await });
        let response = match invocation.await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "handler returned error");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &Error::Handler(err.to_string()));
            }
            Err(join_err) => {
                let cause = if join_err.is_panic() {
                    "handler panicked".to_string()
                } else {
                    "handler task cancelled".to_string()
                };
                tracing::error!(%cause, "handler did not produce a response");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &Error::Handler(cause),
                );
            }
        };

        match self.compress_response(response, response_codec).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "response compression failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, &err)
            }
        }
    }

    fn decompress_request(&self, mut request: StreamRequest) -> Result<StreamRequest, Error> {
        let Some(value) = request.headers.get(CONTENT_ENCODING).cloned() else {
            return Ok(request);
        };
        let name = value.to_str().unwrap_or_default();
        match Codec::from_name(name) {
            Some(Codec::Identity) => {
                request.headers.remove(CONTENT_ENCODING);
                Ok(request)
            }
            Some(codec) => {
                request.body = codec::inflate(&request.body, codec)?;
                request.headers.remove(CONTENT_ENCODING);
                Ok(request)
            }
            None => Err(Error::Codec(format!(
                "unsupported request content-encoding '{name}'"
            ))),
        }
    }

    /// Buffer the tunneled body and restore the original method and query.
    async fn untunnel(
        &self,
        request: StreamRequest,
        ctx: &mut RequestContext,
    ) -> Result<StreamRequest, Error> {
        let body = read_full(
            &request.body,
            Some(self.config.limits.max_response_bytes),
        )
        .await?;
        let mut rest = RestRequest {
            method: request.method,
            uri: request.uri,
            headers: request.headers,
            body,
        };
        rest = tunnel::decode(rest, ctx)?;
        tracing::debug!(method = %rest.method, uri = %rest.uri, "restored tunneled request");
        let mut restored =
            StreamRequest::new(rest.method, rest.uri, byte_stream(rest.body));
        restored.headers = rest.headers;
        Ok(restored)
    }

    /// Compress the response body when it reaches the threshold.
    async fn compress_response(
        &self,
        mut response: StreamResponse,
        codec: Codec,
    ) -> Result<StreamResponse, Error> {
        if codec == Codec::Identity || response.headers.contains_key(CONTENT_ENCODING) {
            return Ok(response);
        }
        let threshold = self.config.limits.compression_threshold;
        match buffer_upto(&response.body, threshold).await? {
            Buffered::Complete(prefix) => {
                // Short body: not worth the codec overhead.
                response.body = chunk_stream(prefix);
                Ok(response)
            }
            Buffered::Partial { prefix, rest } => {
                let recomposed = transform_stream(&rest, PrependTransform::new(prefix))?;
                response.body = codec::deflate(&recomposed, codec)?;
                response
                    .headers
                    .insert(CONTENT_ENCODING, HeaderValue::from_static(codec.name()));
                Ok(response)
            }
        }
    }
}

fn error_response(status: StatusCode, err: &Error) -> StreamResponse {
    let mut response = StreamResponse::new(status, byte_stream(Bytes::from(err.to_string())));
    response
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
