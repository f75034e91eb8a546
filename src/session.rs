use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use hyper::{Method, Request, Response, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    mode::RecordingMode,
    redirect::{ProxyEndpoint, RECORDING_ID_HEADER, header_value},
    registry::{SessionId, SessionRegistry},
    revision::RevisionSource,
    test_id::TestId,
    transport::Transport,
};

pub const RECORD_START_PATH: &str = "/record/start";
pub const RECORD_STOP_PATH: &str = "/record/stop";
pub const PLAYBACK_START_PATH: &str = "/playback/start";
pub const PLAYBACK_STOP_PATH: &str = "/playback/stop";

const RECORDING_FILE_HEADER: &str = "x-recording-file";
const RECORDING_SHA_HEADER: &str = "x-recording-sha";
const RECORDING_SAVE_HEADER: &str = "x-recording-save";

/// Values a test stored alongside its recording, handed back on playback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(BTreeMap<String, String>);

impl Variables {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl From<BTreeMap<String, String>> for Variables {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, String)> for Variables {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedSession {
    pub session_id: SessionId,
    pub variables: Variables,
}

/// Opens and closes recording/playback sessions on the test proxy.
pub struct SessionClient {
    endpoint: ProxyEndpoint,
    mode: RecordingMode,
    transport: Arc<dyn Transport>,
    revision: Arc<dyn RevisionSource>,
    registry: Arc<SessionRegistry>,
}

impl SessionClient {
    pub fn new(
        endpoint: ProxyEndpoint,
        mode: RecordingMode,
        transport: Arc<dyn Transport>,
        revision: Arc<dyn RevisionSource>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            endpoint,
            mode,
            transport,
            revision,
            registry,
        }
    }

    pub fn mode(&self) -> RecordingMode {
        self.mode
    }

    pub async fn start_session(&self, test_id: &TestId) -> Result<StartedSession> {
        let path = match self.mode {
            RecordingMode::Record => RECORD_START_PATH,
            RecordingMode::Playback => PLAYBACK_START_PATH,
            RecordingMode::LiveUnrecorded => return Err(Error::NotRecording),
        };
        let sha = self.revision.revision()?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.url(path)?)
            .header(
                RECORDING_FILE_HEADER,
                header_value(RECORDING_FILE_HEADER, test_id.as_str())?,
            )
            .header(RECORDING_SHA_HEADER, header_value(RECORDING_SHA_HEADER, &sha)?)
            .body(Bytes::new())?;
        let response = self.transport.send(request).await?;

        let session_id = session_id_header(&response);
        let started = match self.mode {
            RecordingMode::Playback => {
                let Some(session_id) = session_id else {
                    return Err(Error::MissingRecording {
                        test_id: test_id.to_string(),
                    });
                };
                StartedSession {
                    session_id,
                    variables: parse_variables(response.body())?,
                }
            }
            _ => StartedSession {
                session_id: session_id.ok_or_else(|| Error::MissingSessionId {
                    endpoint: path.to_owned(),
                })?,
                variables: Variables::default(),
            },
        };

        self.registry.set(test_id.clone(), started.session_id.clone());
        tracing::info!(
            test_id = %test_id,
            session_id = %started.session_id,
            mode = %self.mode,
            variables = started.variables.len(),
            "started test proxy session"
        );
        Ok(started)
    }

    /// Closes the session. When recording, `output` is stored next to the
    /// recording; a test that failed passes `None`.
    pub async fn stop_session(
        &self,
        test_id: &TestId,
        session_id: &SessionId,
        output: Option<&Value>,
    ) -> Result<()> {
        let builder = Request::builder()
            .method(Method::POST)
            .header(
                RECORDING_FILE_HEADER,
                header_value(RECORDING_FILE_HEADER, test_id.as_str())?,
            )
            .header(
                RECORDING_ID_HEADER,
                header_value(RECORDING_ID_HEADER, session_id.as_str())?,
            );
        let (path, request) = match self.mode {
            RecordingMode::Record => {
                let body = output
                    .map(|output| Bytes::from(output.to_string()))
                    .unwrap_or_default();
                let request = builder
                    .uri(self.endpoint.url(RECORD_STOP_PATH)?)
                    .header(RECORDING_SAVE_HEADER, "true")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)?;
                (RECORD_STOP_PATH, request)
            }
            RecordingMode::Playback => {
                let request = builder
                    .uri(self.endpoint.url(PLAYBACK_STOP_PATH)?)
                    .body(Bytes::new())?;
                (PLAYBACK_STOP_PATH, request)
            }
            RecordingMode::LiveUnrecorded => return Err(Error::NotRecording),
        };

        let response = self.transport.send(request).await?;
        if !response.status().is_success() {
            return Err(Error::ProxyStatus {
                endpoint: path.to_owned(),
                status: response.status(),
            });
        }
        tracing::info!(
            test_id = %test_id,
            session_id = %session_id,
            mode = %self.mode,
            "stopped test proxy session"
        );
        Ok(())
    }
}

fn session_id_header(response: &Response<Bytes>) -> Option<SessionId> {
    response
        .headers()
        .get(RECORDING_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(SessionId::new)
}

fn parse_variables(body: &Bytes) -> Result<Variables> {
    if body.is_empty() {
        return Ok(Variables::default());
    }
    serde_json::from_slice(body).map_err(Error::MalformedVariables)
}
