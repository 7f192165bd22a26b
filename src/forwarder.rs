//! HTTP forwarder
//!
//! Replays a decrypted inbound request against the origin the client asked
//! for and streams the upstream response back. Bodies are never buffered in
//! either direction.

use crate::connection_pool::{ConnectionPool, UpstreamBody};
use crate::error::{BoxError, ForwardError};
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{
    HeaderMap, HeaderName, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    TRANSFER_ENCODING,
};
use hyper::http::uri::{Authority, Scheme};
use hyper::{Request, Response, Uri};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Response body handed back to the inbound connection.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Request headers never sent upstream.
pub const DEFAULT_EXCLUDED_REQUEST_HEADERS: [&str; 2] = ["Host", "Accept-Encoding"];

/// Response headers never relayed back; the inbound transport re-derives framing.
pub const DEFAULT_EXCLUDED_RESPONSE_HEADERS: [&str; 2] = ["Transfer-Encoding", "Connection"];

/// Case-insensitive set of header names to drop while copying.
#[derive(Debug, Clone)]
pub struct HeaderFilter {
    excluded: HashSet<HeaderName>,
}

impl HeaderFilter {
    pub fn new<I, S>(names: I) -> Result<Self, hyper::header::InvalidHeaderName>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let excluded = names
            .into_iter()
            .map(|name| HeaderName::from_bytes(name.as_ref().trim().as_bytes()))
            .collect::<Result<_, _>>()?;
        Ok(Self { excluded })
    }

    pub fn default_request() -> Self {
        Self {
            excluded: [HOST, ACCEPT_ENCODING].into_iter().collect(),
        }
    }

    pub fn default_response() -> Self {
        Self {
            excluded: [TRANSFER_ENCODING, CONNECTION].into_iter().collect(),
        }
    }

    pub fn is_excluded(&self, name: &HeaderName) -> bool {
        self.excluded.contains(name)
    }

    /// Copy of `headers` without the excluded names. Repeated headers keep every value.
    pub fn apply(&self, headers: &HeaderMap) -> HeaderMap {
        let mut filtered = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            if !self.is_excluded(name) {
                filtered.append(name.clone(), value.clone());
            }
        }
        filtered
    }
}

/// The origin a request is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamOrigin {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl UpstreamOrigin {
    pub fn new(scheme: Scheme, host: &str, port: Option<u16>) -> Result<Self, ForwardError> {
        let default_port = default_port(&scheme).ok_or_else(|| {
            ForwardError::invalid_target(format!("unsupported scheme {scheme}"))
        })?;
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return Err(ForwardError::MissingHost);
        }

        Ok(Self {
            scheme,
            host,
            port: port.unwrap_or(default_port),
        })
    }

    /// Derive the origin from an absolute request URI, or else from the `Host`
    /// header plus the inbound scheme stored as a [`Scheme`] request extension.
    pub fn from_request<B>(req: &Request<B>) -> Result<Self, ForwardError> {
        let scheme = req
            .uri()
            .scheme()
            .cloned()
            .or_else(|| req.extensions().get::<Scheme>().cloned())
            .unwrap_or(Scheme::HTTP);

        let authority = match req.uri().authority() {
            Some(authority) => authority.clone(),
            None => {
                let host = req.headers().get(HOST).ok_or(ForwardError::MissingHost)?;
                let host = host
                    .to_str()
                    .map_err(|_| ForwardError::invalid_target("Host header is not ASCII"))?;
                host.parse::<Authority>()
                    .map_err(|e| ForwardError::invalid_target(format!("{host}: {e}")))?
            }
        };

        Self::new(scheme, authority.host(), authority.port_u16())
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `scheme://host[:port]`, the port omitted when it is the scheme default.
    pub fn base_address(&self) -> String {
        if Some(self.port) == default_port(&self.scheme) {
            format!("{}://{}", self.scheme, self.host)
        } else {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

impl fmt::Display for UpstreamOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_address())
    }
}

fn default_port(scheme: &Scheme) -> Option<u16> {
    if *scheme == Scheme::HTTPS {
        Some(443)
    } else if *scheme == Scheme::HTTP {
        Some(80)
    } else {
        None
    }
}

/// Rewrites the requested origin before forwarding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OriginMapping {
    /// Forward to exactly what the client asked for.
    #[default]
    Passthrough,
    /// Drop a host suffix, e.g. `api.example.com.test` to `api.example.com` for `.test`.
    StripSuffix(String),
}

impl OriginMapping {
    pub fn apply(&self, origin: UpstreamOrigin) -> UpstreamOrigin {
        match self {
            OriginMapping::Passthrough => origin,
            OriginMapping::StripSuffix(suffix) => {
                let suffix = suffix.to_ascii_lowercase();
                match origin.host.strip_suffix(suffix.as_str()) {
                    Some(stripped) if !stripped.is_empty() => UpstreamOrigin {
                        host: stripped.trim_end_matches('.').to_string(),
                        ..origin
                    },
                    _ => origin,
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub request_filter: HeaderFilter,
    pub response_filter: HeaderFilter,
    /// Upper bound on waiting for upstream response headers.
    pub response_timeout: Option<Duration>,
    pub origin_mapping: OriginMapping,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            request_filter: HeaderFilter::default_request(),
            response_filter: HeaderFilter::default_response(),
            response_timeout: Some(Duration::from_secs(100)),
            origin_mapping: OriginMapping::Passthrough,
        }
    }
}

/// Forwards decrypted requests to their origin through a shared [`ConnectionPool`].
pub struct HttpForwarder {
    pool: Arc<ConnectionPool>,
    settings: ForwarderSettings,
}

impl HttpForwarder {
    pub fn new(pool: Arc<ConnectionPool>, settings: ForwarderSettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Forward `req` upstream and return the response to relay.
    ///
    /// Only response headers are awaited; the body streams as the caller polls
    /// it. Cancelling `cancel` aborts the upstream exchange at any point,
    /// including mid-body, and surfaces as [`ForwardError::Cancelled`] or a body
    /// error respectively.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        cancel: CancellationToken,
    ) -> Result<Response<ProxyBody>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let origin = self
            .settings
            .origin_mapping
            .apply(UpstreamOrigin::from_request(&req)?);
        let base_address = origin.base_address();

        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("{base_address}{path_and_query}")
            .parse()
            .map_err(|e| ForwardError::invalid_target(format!("{base_address}{path_and_query}: {e}")))?;

        tracing::info!(
            method = %parts.method,
            version = ?parts.version,
            base_address = %base_address,
            path = %path_and_query,
            "Forwarding request"
        );
        tracing::debug!(headers = ?parts.headers, "Forwarding request headers");

        let body: UpstreamBody = body.map_err(Into::into).boxed_unsync();
        let mut outbound = Request::new(body);
        *outbound.method_mut() = parts.method;
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = self.settings.request_filter.apply(&parts.headers);

        let client = self.pool.get_client(&base_address);
        let send = async {
            let pending = client.client().request(outbound);
            let result = match self.settings.response_timeout {
                Some(timeout) => tokio::time::timeout(timeout, pending)
                    .await
                    .map_err(|_| ForwardError::Timeout {
                        origin: base_address.clone(),
                        timeout,
                    })?,
                None => pending.await,
            };
            result.map_err(|e| upstream_error(&base_address, e))
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(base_address = %base_address, "Forwarding request was cancelled");
                return Err(ForwardError::Cancelled);
            }
            result = send => result,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(base_address = %base_address, "Forwarding failed: {}", e);
                return Err(e);
            }
        };

        let (parts, body) = response.into_parts();
        tracing::info!(
            status = parts.status.as_u16(),
            content_type = header_str(&parts.headers, &CONTENT_TYPE),
            content_length = header_str(&parts.headers, &CONTENT_LENGTH),
            "Forwarding response"
        );
        tracing::debug!(headers = ?parts.headers, "Forwarding response headers");

        // Content-Type and Content-Length pass through unchanged; without a
        // declared length the inbound side streams chunked.
        let relay = RelayBody::new(body, cancel, base_address);
        let mut relayed = Response::new(relay.boxed_unsync());
        *relayed.status_mut() = parts.status;
        *relayed.headers_mut() = self.settings.response_filter.apply(&parts.headers);

        Ok(relayed)
    }
}

fn upstream_error(origin: &str, error: hyper_util::client::legacy::Error) -> ForwardError {
    if error.is_connect() {
        ForwardError::Connect {
            origin: origin.to_string(),
            source: Box::new(error),
        }
    } else {
        ForwardError::Upstream {
            origin: origin.to_string(),
            source: Box::new(error),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

#[derive(Debug, thiserror::Error)]
#[error("forwarding cancelled while streaming the response body")]
struct BodyCancelled;

/// Upstream response body that stops as soon as the inbound connection goes away.
struct RelayBody {
    inner: Incoming,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    base_address: String,
    finished: bool,
}

impl RelayBody {
    fn new(inner: Incoming, cancel: CancellationToken, base_address: String) -> Self {
        Self {
            inner,
            cancelled: Box::pin(cancel.cancelled_owned()),
            base_address,
            finished: false,
        }
    }
}

impl Body for RelayBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.finished {
            return Poll::Ready(None);
        }

        if self.cancelled.as_mut().poll(cx).is_ready() {
            self.finished = true;
            tracing::info!(base_address = %self.base_address, "Forwarding request was cancelled");
            return Poll::Ready(Some(Err(Box::new(BodyCancelled))));
        }

        match Pin::new(&mut self.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                self.finished = true;
                tracing::info!(base_address = %self.base_address, "Forwarding completed");
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                tracing::warn!(base_address = %self.base_address, "Upstream body failed: {}", e);
                Poll::Ready(Some(Err(Box::new(e))))
            }
            other => other.map_err(|e| -> BoxError { Box::new(e) }),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_request_filter_drops_host_and_accept_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("api.example.com"));
        headers.insert("accept-encoding", HeaderValue::from_static("gzip"));
        headers.insert("accept", HeaderValue::from_static("text/plain"));
        headers.append("x-trace", HeaderValue::from_static("a"));
        headers.append("x-trace", HeaderValue::from_static("b"));

        let filtered = HeaderFilter::default_request().apply(&headers);

        assert!(filtered.get(HOST).is_none());
        assert!(filtered.get("accept-encoding").is_none());
        assert_eq!(filtered.get("accept").unwrap(), "text/plain");
        assert_eq!(filtered.get_all("x-trace").iter().count(), 2);
    }

    #[test]
    fn test_response_filter_drops_framing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("2"));

        let filtered = HeaderFilter::default_response().apply(&headers);

        assert!(filtered.get("transfer-encoding").is_none());
        assert!(filtered.get("connection").is_none());
        assert_eq!(filtered.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(filtered.get(CONTENT_LENGTH).unwrap(), "2");
    }

    #[test]
    fn test_custom_filter_is_case_insensitive() {
        let filter = HeaderFilter::new(["X-Secret", "COOKIE"]).unwrap();
        assert!(filter.is_excluded(&HeaderName::from_static("x-secret")));
        assert!(filter.is_excluded(&hyper::header::COOKIE));
        assert!(!filter.is_excluded(&HOST));
        assert!(HeaderFilter::new(["bad header"]).is_err());
    }

    #[test]
    fn test_origin_from_host_header_and_scheme_extension() {
        let mut req = Request::builder()
            .uri("/status?x=1")
            .header(HOST, "API.Example.com")
            .body(())
            .unwrap();
        req.extensions_mut().insert(Scheme::HTTPS);

        let origin = UpstreamOrigin::from_request(&req).unwrap();
        assert_eq!(origin.host(), "api.example.com");
        assert_eq!(origin.port(), 443);
        assert_eq!(origin.base_address(), "https://api.example.com");
    }

    #[test]
    fn test_origin_keeps_non_default_port() {
        let req = Request::builder()
            .uri("/")
            .header(HOST, "localhost:8080")
            .body(())
            .unwrap();

        let origin = UpstreamOrigin::from_request(&req).unwrap();
        assert_eq!(origin.scheme(), &Scheme::HTTP);
        assert_eq!(origin.base_address(), "http://localhost:8080");
    }

    #[test]
    fn test_origin_from_absolute_uri() {
        let req = Request::builder()
            .uri("https://example.com:443/a")
            .header(HOST, "ignored.example.org")
            .body(())
            .unwrap();

        let origin = UpstreamOrigin::from_request(&req).unwrap();
        assert_eq!(origin.base_address(), "https://example.com");
    }

    #[test]
    fn test_origin_requires_host() {
        let req = Request::builder().uri("/").body(()).unwrap();
        assert!(matches!(
            UpstreamOrigin::from_request(&req),
            Err(ForwardError::MissingHost)
        ));

        let req = Request::builder()
            .uri("/")
            .header(HOST, "bad host")
            .body(())
            .unwrap();
        assert!(matches!(
            UpstreamOrigin::from_request(&req),
            Err(ForwardError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_strip_suffix_mapping() {
        let mapping = OriginMapping::StripSuffix(".proxy.test".to_string());
        let origin = UpstreamOrigin::new(Scheme::HTTPS, "api.example.com.proxy.test", None).unwrap();
        assert_eq!(mapping.apply(origin).base_address(), "https://api.example.com");

        let untouched = UpstreamOrigin::new(Scheme::HTTPS, "example.org", None).unwrap();
        assert_eq!(mapping.apply(untouched.clone()), untouched);

        let whole = UpstreamOrigin::new(Scheme::HTTPS, ".proxy.test", None);
        assert!(whole.is_ok());
        let whole = whole.unwrap();
        assert_eq!(mapping.apply(whole.clone()), whole);
    }
}
