//! Error plumbing shared by every stage.
//!
//! Most fallible calls in this crate return a [`TrackedError`], which
//! remembers where it was raised and what caused it. Use the
//! [`FlowException`] extension trait to wrap any other error with a
//! message and the caller's location.

use std::error::Error;
use std::fmt;
use std::panic::Location;

/// Boxed cause stored inside a [`TrackedError`].
pub type BoxedCause = Box<dyn Error + Send + Sync + 'static>;

/// An error annotated with the source location that raised it and an
/// optional underlying cause.
#[derive(Debug)]
pub struct TrackedError {
    msg: String,
    caller: &'static Location<'static>,
    cause: Option<BoxedCause>,
}

impl TrackedError {
    /// Message attached at the point this error was raised.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Location of the code that raised this error.
    pub fn caller(&self) -> &'static Location<'static> {
        self.caller
    }

    /// Render this error and its whole `source()` chain, one cause
    /// per line.
    pub fn stacktrace(&self) -> String {
        stacktrace(self)
    }
}

impl fmt::Display for TrackedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.caller, self.msg)
    }
}

impl Error for TrackedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn Error + 'static))
    }
}

/// A trait to build a [`TrackedError`] with a custom message from
/// any result whose error can be boxed.
pub trait FlowException<T> {
    /// Only this needs to be implemented.
    fn into_tracked(self) -> Result<T, BoxedCause>;

    /// Make the existing error the cause of a new error carrying
    /// this message and the caller's location.
    ///
    /// Example:
    ///     store.write(records).reraise("error writing dead letters")?;
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T, TrackedError>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_tracked().map_err(|cause| TrackedError {
            msg: msg.to_string(),
            caller,
            cause: Some(cause),
        })
    }

    /// Like [`FlowException::reraise`] but only builds the message
    /// if there was an error.
    #[track_caller]
    fn reraise_with(self, msg: impl FnOnce() -> String) -> Result<T, TrackedError>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_tracked().map_err(|cause| TrackedError {
            msg: msg(),
            caller,
            cause: Some(cause),
        })
    }
}

impl<T, E> FlowException<T> for Result<T, E>
where
    E: Error + Send + Sync + 'static,
{
    fn into_tracked(self) -> Result<T, BoxedCause> {
        self.map_err(|err| Box::new(err) as BoxedCause)
    }
}

/// Use this function to create a [`TrackedError`] with location
/// tracking and no cause.
#[track_caller]
pub fn tracked_err(msg: &str) -> TrackedError {
    TrackedError {
        msg: msg.to_string(),
        caller: Location::caller(),
        cause: None,
    }
}

/// Render an error and each of its causes on its own line.
///
/// This is what ends up in the `stacktrace` field of a failed
/// element, so it must not depend on anything but the error itself.
pub fn stacktrace(err: &(dyn Error + 'static)) -> String {
    let mut lines = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(format!("Caused by => {cause}"));
        source = cause.source();
    }
    lines.join("\n")
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

#[test]
fn reraise_keeps_cause_and_location() {
    let res: Result<(), std::io::Error> = Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no such table",
    ));
    let err = res.reraise("error opening dead letter store").unwrap_err();

    assert_eq!(err.message(), "error opening dead letter store");
    assert_eq!(err.caller().file(), file!());
    assert!(err.to_string().ends_with("error opening dead letter store"));
    assert!(err.stacktrace().contains("Caused by => no such table"));
}

#[test]
fn stacktrace_walks_source_chain() {
    let inner: Result<(), std::io::Error> =
        Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
    let middle = inner.reraise("writing batch").unwrap_err();
    let outer: Result<(), TrackedError> = Err(middle);
    let outer = outer.reraise_with(|| "step dlq".to_string()).unwrap_err();

    let trace = outer.stacktrace();
    let lines: Vec<&str> = trace.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].ends_with("step dlq"));
    assert!(lines[1].ends_with("writing batch"));
    assert_eq!(lines[2], "Caused by => disk full");
}

#[test]
fn prepend_tname_prefixes_each_line() {
    let out = std::thread::Builder::new()
        .name("worker-3".to_string())
        .spawn(|| prepend_tname("first\nsecond".to_string()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(out, "<worker-3> first\n<worker-3> second\n");
}
