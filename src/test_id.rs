use std::fmt;

use crate::error::{Error, Result};

const RECORDINGS_DIR: &str = "recordings";
const TEST_PATH_SEPARATOR: &str = "::";
const RUNTIME_THREAD_NAMES: [&str; 3] = ["main", "tokio-runtime-worker", "tokio-rt-worker"];

/// Names one test, and doubles as the recording file tag sent to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestId(String);

impl TestId {
    /// Builds an id from the test's source path and its (possibly `::`
    /// qualified) name.
    ///
    /// `sdk/storage/tests/blobs.rs` + `blobs::upload` becomes
    /// `sdk/storage/tests/recordings/blobs.blobs.upload`.
    pub fn new(path: &str, name: &str) -> Self {
        let mut segments = normalize_path(path);
        if let Some(last) = segments.last_mut() {
            strip_extension(last);
        }
        if let Some(idx) = segments.iter().position(|segment| segment.starts_with("test")) {
            segments.insert(idx + 1, RECORDINGS_DIR.to_owned());
        }

        let mut id = segments.join("/");
        let name = name
            .split(TEST_PATH_SEPARATOR)
            .map(|part| part.trim().replace(['/', '\\'], "_"))
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(".");
        if !name.is_empty() {
            if !id.is_empty() {
                id.push('.');
            }
            id.push_str(&name);
        }
        Self(id)
    }

    /// Parses the runner's `path/to/file.rs::module::test (call)` form.
    pub fn parse(current_test: &str) -> Result<Self> {
        let Some(token) = current_test.split_whitespace().next() else {
            return Err(Error::UnknownTest("current test description is empty".to_owned()));
        };
        let (path, name) = token.split_once(TEST_PATH_SEPARATOR).unwrap_or((token, ""));
        if path.is_empty() {
            return Err(Error::UnknownTest(format!(
                "`{current_test}` does not start with a test path"
            )));
        }
        Ok(Self::new(path, name))
    }

    /// Identifies the test running on this thread. The libtest harness names
    /// every test thread after the test's module path.
    ///
    /// Runtime worker threads are shared between tests, so calling this from
    /// a spawned task is an error rather than a shared id.
    pub fn current(file: &str) -> Result<Self> {
        let thread = std::thread::current();
        match thread.name() {
            Some(name) if !RUNTIME_THREAD_NAMES.contains(&name) => Ok(Self::new(file, name)),
            Some(name) => Err(Error::UnknownTest(format!(
                "thread `{name}` is not a test thread; call `test_id!` from the test itself"
            ))),
            None => Err(Error::UnknownTest(
                "the current thread is not a named test thread".to_owned(),
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies the running test from inside a `#[test]` function.
///
/// Must run on the test's own thread. Inside a task spawned onto a
/// multi-thread runtime it returns [`Error::UnknownTest`](crate::Error::UnknownTest).
#[macro_export]
macro_rules! test_id {
    () => {
        $crate::TestId::current(file!())
    };
}

fn normalize_path(path: &str) -> Vec<String> {
    let path = path.replace('\\', "/");
    let mut segments: Vec<String> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| last != "..") {
                    segments.pop();
                } else {
                    segments.push(segment.to_owned());
                }
            }
            _ => segments.push(segment.replace(TEST_PATH_SEPARATOR, "")),
        }
    }
    segments
}

fn strip_extension(segment: &mut String) {
    match segment.rfind('.') {
        Some(dot) if dot > 0 => segment.truncate(dot),
        _ => {}
    }
}
