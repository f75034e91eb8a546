//! Record and playback integration-test HTTP traffic through an external test
//! proxy.
//!
//! ```no_run
//! use proxy_recording::{HyperTransport, RecordedTest, TestProxy, TransportHandle, test_id};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let transport = TransportHandle::new(HyperTransport::new()?);
//! let proxy = TestProxy::from_env(transport.clone())?;
//! let test = RecordedTest::new(test_id!()?).with_variables();
//!
//! proxy
//!     .run(&test, |args| async move {
//!         // Build the client under test on `transport`; its requests are
//!         // redirected to the proxy for the duration of the body.
//!         let table = args
//!             .variables
//!             .as_ref()
//!             .and_then(|vars| vars.get("table"))
//!             .unwrap_or("table-live")
//!             .to_owned();
//!         Ok(json!({ "table": table }))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod mode;
pub mod recorded;
pub mod redirect;
pub mod registry;
pub mod revision;
pub mod session;
pub mod test_id;
pub mod transport;

pub use config::Config;
pub use error::{Error, ResourceNotFoundError, Result, TestFailure};
pub use mode::RecordingMode;
pub use recorded::{RecordedTest, TestArgs, TestProxy};
pub use redirect::{ProxyEndpoint, RedirectingTransport, transform_request};
pub use registry::{SessionId, SessionRegistry};
pub use revision::{FixedRevision, GitRevision, RevisionSource};
pub use session::{SessionClient, StartedSession, Variables};
pub use test_id::TestId;
pub use transport::{HyperTransport, StaticTransport, Transport, TransportGuard, TransportHandle};
