//! Request/response messages and the per-request context.
//!
//! # Responsibilities
//! - Define streamed messages (entity-stream bodies) and their buffered
//!   "REST" counterparts (in-memory bodies)
//! - Carry request-scoped dispatch state (fault injection, query-tunnel
//!   flags)
//!
//! # Design Decisions
//! - Heads use the `http` crate types (method, URI, headers, status)
//! - Context attributes are typed fields rather than a string-keyed map

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::disrupt::DisruptContext;
use crate::stream::EntityStream;

/// Request-scoped dispatch state, created per `send` call.
#[derive(Debug, Default, Clone)]
pub struct RequestContext {
    /// Optional fault-injection directive, consumed before dispatch.
    pub disrupt: Option<DisruptContext>,
    /// Tunnel the query regardless of its length.
    pub force_query_tunnel: bool,
    /// Set server-side when an incoming request was un-tunneled.
    pub is_query_tunneled: bool,
}

/// A request whose body is a live entity stream.
pub struct StreamRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: EntityStream,
}

impl StreamRequest {
    pub fn new(method: Method, uri: Uri, body: EntityStream) -> Self {
        StreamRequest {
            method,
            uri,
            headers: HeaderMap::new(),
            body,
        }
    }
}

impl std::fmt::Debug for StreamRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRequest")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("body", &self.body)
            .finish()
    }
}

/// A response whose body is a live entity stream.
pub struct StreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: EntityStream,
}

impl StreamResponse {
    pub fn new(status: StatusCode, body: EntityStream) -> Self {
        StreamResponse {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("body", &self.body)
            .finish()
    }
}

/// A fully buffered request (the convenience "REST" mode).
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RestRequest {
    pub fn get(uri: Uri) -> Self {
        RestRequest {
            method: Method::GET,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn post(uri: Uri, body: Bytes) -> Self {
        RestRequest {
            method: Method::POST,
            uri,
            headers: HeaderMap::new(),
            body,
        }
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}
