//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have ember `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while serving connections or while
/// composing the application.
///
/// The `Display` implementation only prints the details of this level of
/// error; the source chain is exposed through `Error::source()`.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<BoxError>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The request head could not be parsed.
    Parse(Parse),
    /// The request body exceeded the fixed limit.
    BodyTooLarge,
    /// An `io::Error` occurred while reading or writing a network stream.
    Io,
    /// The peer was idle past the deadline and the connection was closed.
    TimedOut,
    /// Loading or building the TLS context failed.
    #[cfg(feature = "tls")]
    TlsConfig,
    /// A registered route failed validation.
    Route(String),
    /// Binding or configuring the listener failed.
    Bind,
    /// Building the runtime or installing signal handlers failed.
    Runtime,
}

#[derive(Debug)]
pub(crate) enum Parse {
    /// Malformed request line or header section.
    Header,
    /// The header section exceeded the fixed buffer.
    HeadTooLarge,
    /// HTTP version other than 1.0 or 1.1.
    Version,
    /// Malformed body framing (content-length or chunk syntax).
    Framing,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Self {
        Self {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<BoxError>>(mut self, cause: C) -> Self {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_parse(parse: Parse) -> Self {
        Self::new(Kind::Parse(parse))
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Self {
        Self::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_timed_out() -> Self {
        Self::new(Kind::TimedOut)
    }

    pub(crate) fn new_body_too_large() -> Self {
        Self::new(Kind::BodyTooLarge)
    }

    pub(crate) fn new_route(detail: impl Into<String>) -> Self {
        Self::new(Kind::Route(detail.into()))
    }

    pub(crate) fn new_bind(cause: std::io::Error) -> Self {
        Self::new(Kind::Bind).with(cause)
    }

    pub(crate) fn new_runtime(cause: std::io::Error) -> Self {
        Self::new(Kind::Runtime).with(cause)
    }

    #[cfg(feature = "tls")]
    pub(crate) fn new_tls_config<C: Into<BoxError>>(cause: C) -> Self {
        Self::new(Kind::TlsConfig).with(cause)
    }

    /// Returns true if this was a request parse error.
    #[must_use]
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if the request body exceeded the fixed limit.
    #[must_use]
    pub fn is_body_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::BodyTooLarge)
    }

    /// Returns true if this error was caused by an idle deadline firing.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        matches!(self.inner.kind, Kind::TimedOut)
    }

    /// Returns true if this error was caused by stream I/O.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if a route failed validation.
    #[must_use]
    pub fn is_route(&self) -> bool {
        matches!(self.inner.kind, Kind::Route(_))
    }

    fn description(&self) -> &str {
        match &self.inner.kind {
            Kind::Parse(Parse::Header) => "invalid request header",
            Kind::Parse(Parse::HeadTooLarge) => "request header section too large",
            Kind::Parse(Parse::Version) => "unsupported HTTP version",
            Kind::Parse(Parse::Framing) => "invalid request body framing",
            Kind::BodyTooLarge => "request body over limit",
            Kind::Io => "connection error",
            Kind::TimedOut => "connection deadline elapsed",
            #[cfg(feature = "tls")]
            Kind::TlsConfig => "TLS context error",
            Kind::Route(detail) => detail,
            Kind::Bind => "failed to bind listener",
            Kind::Runtime => "failed to start reactor",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("ember_http::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(cause: std::io::Error) -> Self {
        Self::new_io(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_is_one_pointer() {
        assert_eq!(
            std::mem::size_of::<Error>(),
            std::mem::size_of::<usize>()
        );
    }

    #[test]
    fn predicates_match_kind() {
        assert!(Error::new_parse(Parse::Header).is_parse());
        assert!(Error::new_body_too_large().is_body_too_large());
        assert!(Error::new_timed_out().is_timed_out());
        assert!(Error::new_route("bad pattern").is_route());
        assert!(!Error::new_timed_out().is_parse());
    }

    #[test]
    fn source_chain_is_exposed() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::new_io(io);
        assert!(err.is_io());
        assert!(err.source().is_some());
    }
}
