//! Query tunneling: rewriting over-long GET queries into POST bodies.
//!
//! # Responsibilities
//! - Client side: move an oversized query string into a tunneled
//!   form-urlencoded body before dispatch
//! - Server side: detect the marker header, restore the original method
//!   and query before handler invocation
//!
//! # Design Decisions
//! - The original method travels in the `X-HTTP-Method-Override` header
//! - Requests below the threshold (and not forced) pass through
//!   untouched in both directions

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Method, Uri};

use crate::error::Error;
use crate::message::{RequestContext, RestRequest};

/// Marker header carrying the pre-rewrite method.
pub const METHOD_OVERRIDE: HeaderName = HeaderName::from_static("x-http-method-override");

const FORM_URL_ENCODED: &str = "application/x-www-form-urlencoded";

/// Whether a request head triggers tunneling.
///
/// A query of length zero is never tunneled, even when forced: a URI
/// like `http://host/path?` would lose its `?` in the rewrite.
pub fn should_tunnel(method: &Method, uri: &Uri, force: bool, threshold: usize) -> bool {
    if *method != Method::GET {
        return false;
    }
    match uri.query() {
        None => false,
        Some(q) if q.is_empty() => false,
        Some(q) => force || q.len() >= threshold,
    }
}

fn strip_query(uri: &Uri) -> Result<Uri, Error> {
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        uri.path()
            .parse()
            .map_err(|_| Error::Connection(format!("unrepresentable tunneled path '{}'", uri.path())))?,
    );
    Uri::from_parts(parts).map_err(|e| Error::Connection(format!("tunnel rewrite failed: {e}")))
}

fn with_query(uri: &Uri, query: &str) -> Result<Uri, Error> {
    let mut parts = uri.clone().into_parts();
    let pq = format!("{}?{}", uri.path(), query);
    parts.path_and_query = Some(
        pq.parse()
            .map_err(|_| Error::Connection(format!("unrepresentable restored query '{query}'")))?,
    );
    Uri::from_parts(parts).map_err(|e| Error::Connection(format!("tunnel restore failed: {e}")))
}

/// Client-side rewrite: move the query into the body and flip to POST.
///
/// Idempotent on non-triggering requests (below threshold, not forced,
/// non-GET, or no query).
pub fn encode(request: RestRequest, ctx: &RequestContext, threshold: usize) -> Result<RestRequest, Error> {
    if !should_tunnel(&request.method, &request.uri, ctx.force_query_tunnel, threshold) {
        return Ok(request);
    }
    let query = request
        .uri
        .query()
        .unwrap_or_default()
        .to_owned();

    let mut headers = request.headers;
    headers.insert(
        METHOD_OVERRIDE,
        HeaderValue::from_str(request.method.as_str())
            .map_err(|e| Error::Connection(format!("tunnel rewrite failed: {e}")))?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_URL_ENCODED));
    headers.remove(CONTENT_LENGTH);

    tracing::debug!(query_len = query.len(), "tunneling oversized query as POST body");
    Ok(RestRequest {
        method: Method::POST,
        uri: strip_query(&request.uri)?,
        headers,
        body: Bytes::from(query),
    })
}

/// Server-side inverse: restore the original method and query.
///
/// Requests without the marker header pass through unchanged. Sets
/// `ctx.is_query_tunneled` when a rewrite was undone.
pub fn decode(request: RestRequest, ctx: &mut RequestContext) -> Result<RestRequest, Error> {
    let Some(original_method) = request.headers.get(&METHOD_OVERRIDE).cloned() else {
        return Ok(request);
    };
    let method = Method::from_bytes(original_method.as_bytes())
        .map_err(|_| Error::Connection("malformed tunneled request: bad method override".into()))?;

    let is_form = request
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().trim() == FORM_URL_ENCODED)
        .unwrap_or(false);
    if !is_form {
        return Err(Error::Connection(
            "malformed tunneled request: body is not form-urlencoded".into(),
        ));
    }

    let tunneled = String::from_utf8(request.body.to_vec())
        .map_err(|_| Error::Connection("malformed tunneled request: non-UTF-8 query".into()))?;

    let mut headers = request.headers;
    headers.remove(&METHOD_OVERRIDE);
    headers.remove(CONTENT_TYPE);
    headers.remove(CONTENT_LENGTH);

    // Debugging middleboxes sometimes append extra params to the
    // rewritten URI; keep them ahead of the restored query.
    let uri = if tunneled.is_empty() {
        request.uri
    } else {
        match request.uri.query() {
            Some(existing) if !existing.is_empty() => {
                with_query(&request.uri, &format!("{existing}&{tunneled}"))?
            }
            _ => with_query(&request.uri, &tunneled)?,
        }
    };

    ctx.is_query_tunneled = true;
    Ok(RestRequest {
        method,
        uri,
        headers,
        body: Bytes::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::default()
    }

    #[test]
    fn short_query_passes_through() {
        let req = RestRequest::get("http://host/res?id=1".parse().unwrap());
        let out = encode(req, &ctx(), 1024).unwrap();
        assert_eq!(out.method, Method::GET);
        assert_eq!(out.uri.query(), Some("id=1"));
        assert!(out.headers.get(&METHOD_OVERRIDE).is_none());
    }

    #[test]
    fn long_query_round_trips() {
        let query = format!("ids={}", "7,".repeat(600));
        let uri: Uri = format!("http://host/res?{query}").parse().unwrap();
        let req = RestRequest::get(uri.clone());

        let encoded = encode(req, &ctx(), 1024).unwrap();
        assert_eq!(encoded.method, Method::POST);
        assert_eq!(encoded.uri.query(), None);
        assert_eq!(encoded.headers.get(&METHOD_OVERRIDE).unwrap(), "GET");
        assert_eq!(encoded.body, Bytes::from(query.clone()));

        let mut server_ctx = ctx();
        let decoded = decode(encoded, &mut server_ctx).unwrap();
        assert!(server_ctx.is_query_tunneled);
        assert_eq!(decoded.method, Method::GET);
        assert_eq!(decoded.uri, uri);
        assert!(decoded.body.is_empty());
        assert!(decoded.headers.get(&METHOD_OVERRIDE).is_none());
    }

    #[test]
    fn forced_tunnel_ignores_threshold() {
        let req = RestRequest::get("http://host/res?id=1".parse().unwrap());
        let forced = RequestContext {
            force_query_tunnel: true,
            ..RequestContext::default()
        };
        let out = encode(req, &forced, 1024).unwrap();
        assert_eq!(out.method, Method::POST);
        assert_eq!(out.body, Bytes::from_static(b"id=1"));
    }

    #[test]
    fn empty_query_never_tunnels() {
        let req = RestRequest::get("http://host/res".parse().unwrap());
        let forced = RequestContext {
            force_query_tunnel: true,
            ..RequestContext::default()
        };
        let out = encode(req, &forced, 0).unwrap();
        assert_eq!(out.method, Method::GET);
    }

    #[test]
    fn untunneled_decode_is_identity() {
        let req = RestRequest::get("http://host/res?id=1".parse().unwrap());
        let mut server_ctx = ctx();
        let out = decode(req, &mut server_ctx).unwrap();
        assert!(!server_ctx.is_query_tunneled);
        assert_eq!(out.uri.query(), Some("id=1"));
    }

    #[test]
    fn decode_merges_extra_debug_params() {
        let query = "a=1&b=2";
        let encoded = encode(
            RestRequest::get(format!("http://host/res?{query}").parse().unwrap()),
            &RequestContext {
                force_query_tunnel: true,
                ..RequestContext::default()
            },
            1024,
        )
        .unwrap();
        // A middlebox tacked its own param onto the tunneled URI.
        let mut tweaked = encoded;
        tweaked.uri = "http://host/res?trace=xyz".parse().unwrap();

        let mut server_ctx = ctx();
        let decoded = decode(tweaked, &mut server_ctx).unwrap();
        assert_eq!(decoded.uri.query(), Some("trace=xyz&a=1&b=2"));
    }
}
