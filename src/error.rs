use bytes::Bytes;
use hyper::{Response, StatusCode};
use serde_json::Value;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no recording found for `{test_id}`")]
    MissingRecording { test_id: String },
    #[error("playback start response body is not a valid variables map: {0}")]
    MalformedVariables(#[source] serde_json::Error),
    #[error("`{endpoint}` response is missing the `x-recording-id` header")]
    MissingSessionId { endpoint: String },
    #[error("`{endpoint}` returned {status}")]
    ProxyStatus { endpoint: String, status: StatusCode },
    #[error("test proxy sessions are disabled while running live without recording")]
    NotRecording,
    #[error("invalid test proxy url `{url}`: {reason}")]
    InvalidProxyUrl { url: String, reason: String },
    #[error("cannot redirect request to `{uri}`: {reason}")]
    InvalidRequestUri { uri: String, reason: String },
    #[error("invalid header value for `{name}`")]
    InvalidHeader { name: String },
    #[error("resolve source revision: {0}")]
    Revision(String),
    #[error("cannot identify the running test: {0}")]
    UnknownTest(String),
    #[error("build test proxy control client: {0:#}")]
    ControlClient(anyhow::Error),
    #[error("http transport: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),
    #[error("read http body: {0}")]
    Body(#[from] hyper::Error),
    #[error("build http request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error(transparent)]
    ResourceNotFound(#[from] ResourceNotFoundError),
    #[error("test failed: {0:#}")]
    Test(anyhow::Error),
}

/// A 404 from a service, carrying the response that caused it.
#[derive(Debug, Error)]
#[error("resource not found: {message}")]
pub struct ResourceNotFoundError {
    message: String,
    response: Response<Bytes>,
}

impl ResourceNotFoundError {
    pub fn new(message: impl Into<String>, response: Response<Bytes>) -> Self {
        Self {
            message: message.into(),
            response,
        }
    }

    pub fn from_response(response: Response<Bytes>) -> Self {
        let message = response
            .status()
            .canonical_reason()
            .unwrap_or("Not Found")
            .to_owned();
        Self::new(message, response)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn response(&self) -> &Response<Bytes> {
        &self.response
    }

    /// Rebuilds the error around the `Message` field of the JSON response body,
    /// the text the service itself reported. Bodies without one are returned
    /// unchanged.
    pub fn with_service_message(self) -> Self {
        let decoded = serde_json::from_slice::<Value>(self.response.body())
            .ok()
            .and_then(|body| body.get("Message").and_then(Value::as_str).map(str::to_owned));
        match decoded {
            Some(message) => Self::new(message, self.response),
            None => self,
        }
    }
}

/// The failure a test body reports back to [`crate::TestProxy::run`].
#[derive(Debug, Error)]
pub enum TestFailure {
    #[error(transparent)]
    ResourceNotFound(#[from] ResourceNotFoundError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<TestFailure> for Error {
    fn from(failure: TestFailure) -> Self {
        match failure {
            TestFailure::ResourceNotFound(err) => Self::ResourceNotFound(err),
            TestFailure::Other(err) => Self::Test(err),
        }
    }
}
