use std::sync::Arc;

use bytes::Bytes;
use hyper::{
    Request, Uri,
    header::HeaderValue,
    http::uri::{Authority, Scheme},
};

use crate::{
    error::{Error, Result},
    mode::RecordingMode,
    registry::SessionId,
    transport::{SendFuture, Transport},
};

pub const UPSTREAM_BASE_URI_HEADER: &str = "x-recording-upstream-base-uri";
pub const RECORDING_ID_HEADER: &str = "x-recording-id";
pub const RECORDING_MODE_HEADER: &str = "x-recording-mode";

/// Scheme and network location of the test proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    scheme: Scheme,
    authority: Authority,
}

impl ProxyEndpoint {
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidProxyUrl {
            url: url.to_owned(),
            reason: reason.to_owned(),
        };
        let uri: Uri = url.trim().parse().map_err(|err| invalid(&format!("{err}")))?;
        let scheme = match uri.scheme_str() {
            Some("http" | "https") => uri.scheme().cloned().ok_or_else(|| invalid("no scheme"))?,
            _ => return Err(invalid("scheme must be http or https")),
        };
        let authority = uri.authority().cloned().ok_or_else(|| invalid("no host"))?;
        Ok(Self { scheme, authority })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Absolute URI of one of the proxy's control endpoints.
    pub fn url(&self, path: &str) -> Result<Uri> {
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path)
            .build()
            .map_err(Error::from)
    }
}

/// Points `request` at the proxy and tags it with the session it belongs to.
///
/// The original `scheme://authority` is kept in
/// `x-recording-upstream-base-uri`. That header is only written when absent,
/// so a request that is sent again keeps its first upstream.
pub fn transform_request<B>(
    request: &mut Request<B>,
    endpoint: &ProxyEndpoint,
    session_id: &SessionId,
    mode: RecordingMode,
) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidRequestUri {
        uri: request.uri().to_string(),
        reason: reason.to_owned(),
    };
    let (Some(scheme), Some(authority)) = (request.uri().scheme(), request.uri().authority())
    else {
        return Err(invalid("request uri is not absolute"));
    };
    let Some(mode_value) = mode.header_value() else {
        return Err(Error::NotRecording);
    };
    let upstream_base = format!("{scheme}://{authority}");

    let mut parts = request.uri().clone().into_parts();
    parts.scheme = Some(endpoint.scheme.clone());
    parts.authority = Some(endpoint.authority.clone());
    let proxied = Uri::from_parts(parts).map_err(|err| invalid(&format!("{err}")))?;

    let headers = request.headers_mut();
    if !headers.contains_key(UPSTREAM_BASE_URI_HEADER) {
        let value = header_value(UPSTREAM_BASE_URI_HEADER, &upstream_base)?;
        headers.insert(UPSTREAM_BASE_URI_HEADER, value);
    }
    headers.insert(
        RECORDING_ID_HEADER,
        header_value(RECORDING_ID_HEADER, session_id.as_str())?,
    );
    headers.insert(RECORDING_MODE_HEADER, HeaderValue::from_static(mode_value));
    *request.uri_mut() = proxied;
    Ok(())
}

pub(crate) fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| Error::InvalidHeader {
        name: name.to_owned(),
    })
}

/// Sends every request through the proxy on behalf of one session.
pub struct RedirectingTransport {
    inner: Arc<dyn Transport>,
    endpoint: ProxyEndpoint,
    session_id: SessionId,
    mode: RecordingMode,
}

impl RedirectingTransport {
    pub fn new(
        inner: Arc<dyn Transport>,
        endpoint: ProxyEndpoint,
        session_id: SessionId,
        mode: RecordingMode,
    ) -> Self {
        Self {
            inner,
            endpoint,
            session_id,
            mode,
        }
    }
}

impl Transport for RedirectingTransport {
    fn send(&self, mut request: Request<Bytes>) -> SendFuture<'_> {
        let redirected =
            transform_request(&mut request, &self.endpoint, &self.session_id, self.mode);
        if let Err(err) = redirected {
            return Box::pin(async move { Err(err) });
        }
        tracing::trace!(
            uri = %request.uri(),
            session_id = %self.session_id,
            "redirected request to test proxy"
        );
        self.inner.send(request)
    }
}
