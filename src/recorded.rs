//! Runs a test body inside a test proxy session.
//!
//! [`TestProxy::run`] starts a session, points the shared [`TransportHandle`]
//! at the proxy, runs the body, then puts the original transport back and
//! stops the session. Cleanup happens on every exit path, panics included.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, OnceLock},
};

use futures::FutureExt as _;
use serde_json::Value;

use crate::{
    config::Config,
    error::{Error, Result, TestFailure},
    logging,
    mode::RecordingMode,
    redirect::{ProxyEndpoint, RedirectingTransport},
    registry::{SessionId, SessionRegistry},
    revision::{FixedRevision, GitRevision, RevisionSource},
    session::{SessionClient, Variables},
    test_id::TestId,
    transport::{HyperTransport, Transport, TransportHandle},
};

/// A test registered for recording, with the optional capabilities it opts into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTest {
    id: TestId,
    wants_variables: bool,
}

impl RecordedTest {
    pub fn new(id: TestId) -> Self {
        Self {
            id,
            wants_variables: false,
        }
    }

    /// Declares that the body reads recorded variables from [`TestArgs`].
    pub fn with_variables(mut self) -> Self {
        self.wants_variables = true;
        self
    }

    pub fn id(&self) -> &TestId {
        &self.id
    }

    pub fn wants_variables(&self) -> bool {
        self.wants_variables
    }
}

/// What the test body receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestArgs {
    pub mode: RecordingMode,
    /// `Some` only for tests registered with [`RecordedTest::with_variables`].
    pub variables: Option<Variables>,
}

pub struct TestProxy {
    endpoint: ProxyEndpoint,
    mode: RecordingMode,
    registry: Arc<SessionRegistry>,
    control: OnceLock<Arc<dyn Transport>>,
    revision: Arc<dyn RevisionSource>,
    transport: TransportHandle,
}

impl TestProxy {
    /// `transport` is the handle the code under test sends its requests
    /// through. Session control requests go over a separate client, built on
    /// first use unless one is supplied with [`Self::with_control_transport`].
    pub fn new(config: &Config, transport: TransportHandle) -> anyhow::Result<Self> {
        let endpoint = ProxyEndpoint::parse(&config.proxy.url)?;
        let revision: Arc<dyn RevisionSource> = match config.proxy.revision.as_deref() {
            Some(sha) => Arc::new(FixedRevision::new(sha)),
            None => Arc::new(GitRevision::new(".")),
        };
        Ok(Self {
            endpoint,
            mode: config.recording_mode(),
            registry: Arc::new(SessionRegistry::new()),
            control: OnceLock::new(),
            revision,
            transport,
        })
    }

    /// Discovers configuration, applies environment overrides and sets up
    /// logging for the test process.
    pub fn from_env(transport: TransportHandle) -> anyhow::Result<Self> {
        let config = Config::discover()?;
        logging::init_once(&config)?;
        Self::new(&config, transport)
    }

    pub fn with_control_transport(self, control: Arc<dyn Transport>) -> Self {
        Self {
            control: OnceLock::from(control),
            ..self
        }
    }

    pub fn with_revision_source(mut self, revision: Arc<dyn RevisionSource>) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn mode(&self) -> RecordingMode {
        self.mode
    }

    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// The session a test is currently bound to, as a sanitizer would look it up.
    pub fn session_id(&self, test_id: &TestId) -> Option<SessionId> {
        self.registry.get(test_id)
    }

    pub fn session_client(&self) -> Result<SessionClient> {
        Ok(SessionClient::new(
            self.endpoint.clone(),
            self.mode,
            self.control_transport()?,
            Arc::clone(&self.revision),
            Arc::clone(&self.registry),
        ))
    }

    fn control_transport(&self) -> Result<Arc<dyn Transport>> {
        if let Some(control) = self.control.get() {
            return Ok(Arc::clone(control));
        }
        let built: Arc<dyn Transport> =
            Arc::new(HyperTransport::new().map_err(Error::ControlClient)?);
        // A concurrent first call may have won; use whichever landed.
        Ok(Arc::clone(self.control.get_or_init(|| built)))
    }

    pub async fn run<F, Fut>(&self, test: &RecordedTest, body: F) -> Result<Value>
    where
        F: FnOnce(TestArgs) -> Fut,
        Fut: Future<Output = Result<Value, TestFailure>>,
    {
        if self.mode.is_live_and_not_recording() {
            tracing::debug!(test_id = %test.id, "running live without the test proxy");
            let args = TestArgs {
                mode: self.mode,
                variables: test.wants_variables.then(Variables::default),
            };
            return body(args).await.map_err(Error::from);
        }

        let sessions = self.session_client()?;
        let started = sessions.start_session(&test.id).await?;
        let session_id = started.session_id;

        let endpoint = self.endpoint.clone();
        let mode = self.mode;
        let hook_session = session_id.clone();
        let guard = self.transport.install(move |inner| {
            Arc::new(RedirectingTransport::new(inner, endpoint, hook_session, mode))
        });

        let variables = if test.wants_variables {
            Some(started.variables)
        } else {
            if !started.variables.is_empty() {
                tracing::info!(
                    test_id = %test.id,
                    "recorded variables are available but the test does not accept them; \
                     register it with `RecordedTest::with_variables` to use them"
                );
            }
            None
        };
        let args = TestArgs { mode, variables };

        let outcome = AssertUnwindSafe(async move { body(args).await })
            .catch_unwind()
            .await;

        guard.restore();
        let (result, panic) = match outcome {
            Ok(result) => (result.map_err(rewrap_failure), None),
            Err(panic) => (
                Err(Error::Test(anyhow::anyhow!("test body panicked"))),
                Some(panic),
            ),
        };

        let stopped = sessions
            .stop_session(&test.id, &session_id, result.as_ref().ok())
            .await;
        if let Some(panic) = panic {
            if let Err(err) = &stopped {
                tracing::warn!(test_id = %test.id, "failed to stop session after panic: {err}");
            }
            std::panic::resume_unwind(panic);
        }

        match (result, stopped) {
            (Ok(output), Ok(())) => Ok(output),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(stop_err)) => {
                tracing::warn!(
                    test_id = %test.id,
                    "failed to stop session after test failure: {stop_err}"
                );
                Err(err)
            }
        }
    }
}

fn rewrap_failure(failure: TestFailure) -> Error {
    match failure {
        TestFailure::ResourceNotFound(err) => Error::ResourceNotFound(err.with_service_message()),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use bytes::Bytes;
    use hyper::{Request, Response, StatusCode};
    use serde_json::{Value, json};

    use super::{RecordedTest, TestProxy};
    use crate::{
        config::Config,
        error::{Error, ResourceNotFoundError, TestFailure},
        mode::RecordingMode,
        registry::SessionId,
        revision::FixedRevision,
        test_id::TestId,
        transport::{SendFuture, StaticTransport, Transport, TransportHandle},
    };

    #[derive(Default)]
    struct FakeProxy {
        control: Mutex<Vec<Request<Bytes>>>,
        variables: &'static [u8],
        stop_status: StatusCode,
    }

    impl Transport for FakeProxy {
        fn send(&self, request: Request<Bytes>) -> SendFuture<'_> {
            let path = request.uri().path().to_owned();
            self.control.lock().unwrap().push(request);
            let mut response = Response::new(Bytes::new());
            if path.ends_with("/start") {
                response
                    .headers_mut()
                    .insert("x-recording-id", "session-1".parse().unwrap());
                *response.body_mut() = Bytes::from_static(self.variables);
            } else if path.ends_with("/stop") {
                *response.status_mut() = self.stop_status;
            }
            Box::pin(async move { Ok::<_, Error>(response) })
        }
    }

    fn proxy_for(live: bool, skip: bool, fake: Arc<FakeProxy>) -> TestProxy {
        let mut config = Config::default();
        config.mode.live = live;
        config.mode.skip_recording = skip;
        let handle = TransportHandle::new(StaticTransport::new(Response::new(Bytes::new())));
        TestProxy::new(&config, handle)
            .unwrap()
            .with_control_transport(fake)
            .with_revision_source(Arc::new(FixedRevision::new("abc")))
    }

    fn paths(fake: &FakeProxy) -> Vec<String> {
        fake.control
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.uri().path().to_owned())
            .collect()
    }

    fn task_panics() -> bool {
        true
    }

    fn failing_stop() -> Arc<FakeProxy> {
        Arc::new(FakeProxy {
            stop_status: StatusCode::INTERNAL_SERVER_ERROR,
            ..FakeProxy::default()
        })
    }

    fn recorded() -> RecordedTest {
        RecordedTest::new(TestId::new("tests/unit.rs", "recorded::case"))
    }

    #[tokio::test]
    async fn pass_through_never_contacts_proxy() {
        let fake = Arc::new(FakeProxy::default());
        let proxy = proxy_for(true, true, Arc::clone(&fake));
        let before = proxy.transport().current();

        let output = proxy
            .run(&recorded().with_variables(), |args| async move {
                assert_eq!(args.mode, RecordingMode::LiveUnrecorded);
                assert_eq!(args.variables, Some(Default::default()));
                Ok(json!("live"))
            })
            .await
            .unwrap();

        assert_eq!(output, json!("live"));
        assert!(paths(&fake).is_empty());
        assert!(Arc::ptr_eq(&before, &proxy.transport().current()));
    }

    #[tokio::test]
    async fn body_runs_once_with_hook_installed() {
        let fake = Arc::new(FakeProxy::default());
        let proxy = proxy_for(true, false, Arc::clone(&fake));
        let before = proxy.transport().current();
        let calls = AtomicUsize::new(0);

        let output = proxy
            .run(&recorded(), |args| {
                calls.fetch_add(1, Ordering::SeqCst);
                let hooked = !Arc::ptr_eq(&before, &proxy.transport().current());
                async move {
                    assert!(hooked);
                    assert!(args.variables.is_none());
                    Ok(json!({"created": true}))
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(output, json!({"created": true}));
        assert_eq!(paths(&fake), ["/record/start", "/record/stop"]);
        assert!(Arc::ptr_eq(&before, &proxy.transport().current()));
        assert_eq!(
            proxy.session_id(recorded().id()),
            Some(SessionId::new("session-1"))
        );

        let control = fake.control.lock().unwrap();
        let stored: Value = serde_json::from_slice(control[1].body()).unwrap();
        assert_eq!(stored, json!({"created": true}));
    }

    #[tokio::test]
    async fn playback_variables_reach_tests_that_declare_them() {
        let fake = Arc::new(FakeProxy {
            variables: br#"{"table": "t1"}"#,
            ..FakeProxy::default()
        });
        let proxy = proxy_for(false, false, Arc::clone(&fake));

        let seen = proxy
            .run(&recorded().with_variables(), |args| async move {
                let table = args
                    .variables
                    .as_ref()
                    .and_then(|vars| vars.get("table"))
                    .unwrap_or_default()
                    .to_owned();
                Ok(json!(table))
            })
            .await
            .unwrap();
        assert_eq!(seen, json!("t1"));

        let undeclared = proxy
            .run(&recorded(), |args| async move {
                Ok(json!(args.variables.is_none()))
            })
            .await
            .unwrap();
        assert_eq!(undeclared, json!(true));
    }

    #[tokio::test]
    async fn failures_still_restore_and_stop() {
        let fake = Arc::new(FakeProxy::default());
        let proxy = proxy_for(true, false, Arc::clone(&fake));
        let before = proxy.transport().current();

        let err = proxy
            .run(&recorded(), |_| async {
                Err(TestFailure::Other(anyhow::anyhow!("assertion failed")))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Test(_)), "err: {err}");
        assert!(Arc::ptr_eq(&before, &proxy.transport().current()));
        assert_eq!(paths(&fake), ["/record/start", "/record/stop"]);
        assert!(fake.control.lock().unwrap()[1].body().is_empty());
    }

    #[tokio::test]
    async fn resource_not_found_carries_service_message() {
        let fake = Arc::new(FakeProxy::default());
        let proxy = proxy_for(false, false, fake);

        let err = proxy
            .run(&recorded(), |_| async {
                let mut response = Response::new(Bytes::from_static(br#"{"Message": "not found"}"#));
                *response.status_mut() = StatusCode::NOT_FOUND;
                Err(TestFailure::from(ResourceNotFoundError::from_response(response)))
            })
            .await
            .unwrap_err();

        match err {
            Error::ResourceNotFound(err) => {
                assert_eq!(err.message(), "not found");
                assert_eq!(err.response().status(), StatusCode::NOT_FOUND);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn panics_restore_transport_then_resume() {
        let fake = Arc::new(FakeProxy::default());
        let proxy = Arc::new(proxy_for(false, false, Arc::clone(&fake)));
        let before = proxy.transport().current();

        let task_proxy = Arc::clone(&proxy);
        let joined = tokio::spawn(async move {
            task_proxy
                .run(&recorded(), |_| async {
                    if task_panics() {
                        panic!("body exploded");
                    }
                    Ok(Value::Null)
                })
                .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert!(Arc::ptr_eq(&before, &proxy.transport().current()));
        assert_eq!(paths(&fake), ["/playback/start", "/playback/stop"]);
    }

    #[tokio::test]
    async fn stop_failure_fails_an_otherwise_passing_test() {
        let fake = failing_stop();
        let proxy = proxy_for(true, false, Arc::clone(&fake));
        let before = proxy.transport().current();

        let err = proxy
            .run(&recorded(), |_| async { Ok(json!("done")) })
            .await
            .unwrap_err();

        match err {
            Error::ProxyStatus { endpoint, status } => {
                assert!(endpoint.ends_with("/record/stop"), "endpoint: {endpoint}");
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(Arc::ptr_eq(&before, &proxy.transport().current()));
    }

    #[tokio::test]
    async fn test_failure_wins_over_stop_failure() {
        let fake = failing_stop();
        let proxy = proxy_for(false, false, Arc::clone(&fake));

        let err = proxy
            .run(&recorded(), |_| async {
                Err(TestFailure::Other(anyhow::anyhow!("assertion failed")))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Test(_)), "err: {err}");
        assert!(err.to_string().contains("assertion failed"), "err: {err}");
        assert_eq!(paths(&fake), ["/playback/start", "/playback/stop"]);
    }

    #[tokio::test]
    async fn panic_resumes_even_when_stop_fails() {
        let fake = failing_stop();
        let proxy = Arc::new(proxy_for(true, false, Arc::clone(&fake)));
        let before = proxy.transport().current();

        let task_proxy = Arc::clone(&proxy);
        let joined = tokio::spawn(async move {
            task_proxy
                .run(&recorded(), |_| async {
                    if task_panics() {
                        panic!("body exploded");
                    }
                    Ok(Value::Null)
                })
                .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert!(Arc::ptr_eq(&before, &proxy.transport().current()));
        assert_eq!(paths(&fake), ["/record/start", "/record/stop"]);
    }

    #[tokio::test]
    async fn pass_through_never_builds_a_control_client() {
        let mut config = Config::default();
        config.mode.live = true;
        config.mode.skip_recording = true;
        let handle = TransportHandle::new(StaticTransport::new(Response::new(Bytes::new())));
        let proxy = TestProxy::new(&config, handle).unwrap();

        let output = proxy
            .run(&recorded(), |_| async { Ok(json!("live")) })
            .await
            .unwrap();

        assert_eq!(output, json!("live"));
        assert!(proxy.control.get().is_none());
    }
}
