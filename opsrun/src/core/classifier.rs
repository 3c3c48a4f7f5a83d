//! Deterministic classification of command failures into retry kinds.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Classification of a failure, used to decide whether a retry is worthwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection reset, DNS hiccup, dropped transfer.
    TransientIo,
    Timeout,
    /// Remote refused the request because of request volume.
    RateLimited,
    Auth,
    NotFound,
    /// Anything else. Never worth retrying unless a policy opts in.
    Fatal,
}

impl ErrorKind {
    /// Kinds treated as transient when a policy does not say otherwise.
    pub const DEFAULT_TRANSIENT: [ErrorKind; 2] = [ErrorKind::TransientIo, ErrorKind::Timeout];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that know their own [`ErrorKind`].
///
/// The retry executor only ever asks this question; it never inspects error
/// messages itself.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for ErrorKind {
    fn kind(&self) -> ErrorKind {
        *self
    }
}

impl Classify for std::io::Error {
    fn kind(&self) -> ErrorKind {
        use std::io::ErrorKind as Io;
        match std::io::Error::kind(self) {
            Io::TimedOut | Io::WouldBlock => ErrorKind::Timeout,
            Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::ConnectionRefused
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::UnexpectedEof
            | Io::Interrupted => ErrorKind::TransientIo,
            Io::PermissionDenied => ErrorKind::Auth,
            Io::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::Fatal,
        }
    }
}

// Checked in order; the first match wins.
static PATTERNS: LazyLock<Vec<(ErrorKind, Regex)>> = LazyLock::new(|| {
    [
        (
            ErrorKind::RateLimited,
            r"(?i)rate limit|too many requests|HTTP 429|abuse detection",
        ),
        (
            ErrorKind::Timeout,
            r"(?i)timed out|timeout|operation too slow",
        ),
        (
            ErrorKind::TransientIo,
            r"(?i)could not resolve host|connection (reset|refused|closed)|early eof|remote end hung up|rpc failed|unexpected disconnect|temporary failure|network is unreachable|HTTP (502|503|504)|bad gateway|service unavailable|ssl_error|gnutls",
        ),
        (
            ErrorKind::Auth,
            r"(?i)authentication failed|permission denied|could not read username|bad credentials|HTTP 40[13]|gh auth login",
        ),
        (
            ErrorKind::NotFound,
            r"(?i)not found|does not appear to be a git repository|couldn't find remote ref|no such remote|HTTP 404",
        ),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("classifier pattern compiles")))
    .collect()
});

/// Classify the stderr of a failed `git`/`gh`/`docker` invocation.
///
/// Empty input is `Fatal`: a tool that fails silently gives nothing to retry on.
pub fn classify_command_failure(stderr: &str) -> ErrorKind {
    PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(stderr))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Fatal)
}
