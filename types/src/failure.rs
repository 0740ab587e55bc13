//! The `(status, reason)` rejection payload shared by broker readiness and API calls.

use std::error::Error;
use std::fmt;

use crate::envelope::ApiReply;

/// The relay's refusal of a call with no api path.
pub const EMPTY_INTERFACE: &str = "interface can not be empty";

const UNSUPPORTED_PREFIX: &str = "interface \"";
const UNSUPPORTED_SUFFIX: &str = "\" is not supported";

/// Classification of a rejection.
///
/// Correlation misses never become a `Failure`: an unknown response id is logged
/// and dropped where it is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Capability missing or solution unknown.
    TransportUnsupported,
    /// Transport initialization exceeded its bound.
    TransportTimeout,
    /// The relay answered with an explicit error.
    TransportRejectedByRemote,
    /// Empty or disallowed api path.
    CallNotAllowed,
    /// Status `-1`: the request never produced an HTTP response.
    NetworkFailure,
    /// Non-success HTTP status.
    RemoteApiError,
}

/// A rejection: HTTP-like status (`-1` when no response exists) and a reason.
///
/// A non-success HTTP reply keeps its body and headers in [`Failure::response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    kind: FailureKind,
    status: i64,
    reason: String,
    response: Option<ApiReply>,
}

impl Failure {
    #[must_use]
    pub fn new(kind: FailureKind, status: i64, reason: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            reason: reason.into(),
            response: None,
        }
    }

    /// Attach the body and headers of the reply that caused the rejection.
    #[must_use]
    pub fn with_response(mut self, response: ApiReply) -> Self {
        self.response = Some(response);
        self
    }

    /// Capability missing: "browser not supported".
    #[must_use]
    pub fn unsupported() -> Self {
        Self::new(FailureKind::TransportUnsupported, -1, "browser not supported")
    }

    #[must_use]
    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::TransportTimeout, -1, reason)
    }

    #[must_use]
    pub fn not_allowed(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::CallNotAllowed, -1, reason)
    }

    #[must_use]
    pub fn empty_interface() -> Self {
        Self::not_allowed(EMPTY_INTERFACE)
    }

    /// An api path outside the allow-list.
    #[must_use]
    pub fn unsupported_interface(api: &str) -> Self {
        Self::not_allowed(format!("{UNSUPPORTED_PREFIX}{api}{UNSUPPORTED_SUFFIX}"))
    }

    #[must_use]
    pub fn network(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::NetworkFailure, -1, reason)
    }

    /// The synthesized completion of an aborted in-flight operation.
    #[must_use]
    pub fn aborted() -> Self {
        Self::network("aborted")
    }

    /// Classify a `(status, statusText)` pair received from the other side of a transport.
    ///
    /// The relay's allow-list refusals travel as plain `[-1, reason]` pairs and
    /// are recognized by their reason.
    #[must_use]
    pub fn from_remote(status: i64, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let kind = match status {
            -1 if is_interface_refusal(&reason) => FailureKind::CallNotAllowed,
            -1 => FailureKind::TransportRejectedByRemote,
            _ => FailureKind::RemoteApiError,
        };
        Self::new(kind, status, reason)
    }

    #[must_use]
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    #[must_use]
    pub fn status(&self) -> i64 {
        self.status
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    #[must_use]
    pub fn response(&self) -> Option<&ApiReply> {
        self.response.as_ref()
    }

    /// The `(status, reason)` pair handed to failure callbacks.
    #[must_use]
    pub fn pair(&self) -> (i64, &str) {
        (self.status, &self.reason)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.status, self.reason)
    }
}

impl Error for Failure {}

fn is_interface_refusal(reason: &str) -> bool {
    reason == EMPTY_INTERFACE
        || (reason.starts_with(UNSUPPORTED_PREFIX) && reason.ends_with(UNSUPPORTED_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_minus_one_is_relay_rejection() {
        let failure = Failure::from_remote(-1, "unsupported http method \"PATCH\"");
        assert_eq!(failure.kind(), FailureKind::TransportRejectedByRemote);
        assert_eq!(failure.pair(), (-1, "unsupported http method \"PATCH\""));
    }

    #[test]
    fn interface_refusals_are_not_allowed() {
        let empty = Failure::from_remote(-1, EMPTY_INTERFACE);
        assert_eq!(empty.kind(), FailureKind::CallNotAllowed);
        assert_eq!(empty, Failure::empty_interface());

        let unsupported = Failure::unsupported_interface("/private/messages");
        assert_eq!(
            unsupported.reason(),
            "interface \"/private/messages\" is not supported"
        );
        assert_eq!(
            Failure::from_remote(-1, unsupported.reason()).kind(),
            FailureKind::CallNotAllowed
        );
    }

    #[test]
    fn refusal_wording_with_http_status_is_api_error() {
        let failure = Failure::from_remote(400, EMPTY_INTERFACE);
        assert_eq!(failure.kind(), FailureKind::RemoteApiError);
    }

    #[test]
    fn remote_http_status_is_api_error() {
        let failure = Failure::from_remote(500, "Internal Server Error");
        assert_eq!(failure.kind(), FailureKind::RemoteApiError);
        assert_eq!(failure.to_string(), "(500, Internal Server Error)");
    }

    #[test]
    fn aborted_is_network_failure() {
        assert_eq!(Failure::aborted().pair(), (-1, "aborted"));
        assert_eq!(Failure::aborted().kind(), FailureKind::NetworkFailure);
    }
}
