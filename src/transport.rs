//! The HTTP send seam shared by the code under test and the session client.
//!
//! Code under test sends through a [`TransportHandle`]. While a recorded test
//! runs, the handle's transport is swapped for one that redirects to the test
//! proxy; the returned [`TransportGuard`] puts the original back when it is
//! restored or dropped.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, PoisonError, RwLock},
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::error::{Error, Result};

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<Response<Bytes>>> + Send + 'a>>;

pub trait Transport: Send + Sync {
    fn send(&self, request: Request<Bytes>) -> SendFuture<'_>;
}

type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Real network transport: hyper's pooled client over rustls, speaking
/// HTTP/1 or HTTP/2 to `http` and `https` targets.
#[derive(Clone)]
pub struct HyperTransport {
    client: HttpClient,
}

impl HyperTransport {
    pub fn new() -> anyhow::Result<Self> {
        ensure_rustls_crypto_provider()?;
        let builder = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(err) => {
                // A local plain-http proxy still works without any roots.
                tracing::warn!("no native TLS root certificates, https upstreams will fail: {err}");
                let tls = rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                HttpsConnectorBuilder::new().with_tls_config(tls)
            }
        };
        let connector = builder
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }
}

impl fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: Request<Bytes>) -> SendFuture<'_> {
        Box::pin(async move {
            let response = self.client.request(request.map(Full::new)).await?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok(Response::from_parts(parts, body))
        })
    }
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

/// A shared slot holding the transport that requests currently go through.
#[derive(Clone)]
pub struct TransportHandle {
    current: Arc<RwLock<Arc<dyn Transport>>>,
}

impl TransportHandle {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<dyn Transport>) -> Self {
        Self {
            current: Arc::new(RwLock::new(transport)),
        }
    }

    pub fn current(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replaces the installed transport with `wrap(current)` until the
    /// returned guard is restored or dropped.
    pub fn install(
        &self,
        wrap: impl FnOnce(Arc<dyn Transport>) -> Arc<dyn Transport>,
    ) -> TransportGuard {
        let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let original = Arc::clone(&slot);
        *slot = wrap(Arc::clone(&original));
        tracing::debug!("installed transport hook");
        TransportGuard {
            handle: self.clone(),
            original: Some(original),
        }
    }

    pub async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let transport = self.current();
        transport.send(request).await
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle").finish_non_exhaustive()
    }
}

impl Transport for TransportHandle {
    fn send(&self, request: Request<Bytes>) -> SendFuture<'_> {
        Box::pin(TransportHandle::send(self, request))
    }
}

/// Restores the transport that was installed before [`TransportHandle::install`].
#[must_use = "dropping the guard immediately restores the original transport"]
pub struct TransportGuard {
    handle: TransportHandle,
    original: Option<Arc<dyn Transport>>,
}

impl TransportGuard {
    pub fn restore(mut self) {
        self.put_back();
    }

    fn put_back(&mut self) {
        if let Some(original) = self.original.take() {
            *self
                .handle
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner) = original;
            tracing::debug!("restored original transport");
        }
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.put_back();
    }
}

/// Responds to every request with a clone of a fixed response. Handy as the
/// inner transport in tests.
#[derive(Debug)]
pub struct StaticTransport {
    response: Response<Bytes>,
}

impl StaticTransport {
    pub fn new(response: Response<Bytes>) -> Self {
        Self { response }
    }
}

impl Transport for StaticTransport {
    fn send(&self, _request: Request<Bytes>) -> SendFuture<'_> {
        let mut response = Response::new(self.response.body().clone());
        *response.status_mut() = self.response.status();
        *response.headers_mut() = self.response.headers().clone();
        Box::pin(async move { Ok::<_, Error>(response) })
    }
}
