//! Contains the `Error` and `Result` types that `mongodb-sdam` uses.

use std::{collections::HashSet, fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

use crate::{bson::Document, options::ServerAddress, sdam::TopologyDescription};

const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const NOTWRITABLEPRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];

/// The result type for all methods that can return an error in the `mongodb-sdam` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongodb-sdam` crate. The inner
/// [`ErrorKind`](enum.ErrorKind.html) is wrapped in a `Box` to keep the error small.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        Self {
            kind: Box::new(kind),
            labels: labels
                .map(|labels| labels.into_iter().collect())
                .unwrap_or_default(),
        }
    }

    pub(crate) fn pool_cleared_error(address: &ServerAddress, cause: &Error) -> Self {
        ErrorKind::ConnectionPoolCleared {
            message: format!(
                "Connection pool for {address} cleared because another operation failed with: \
                 {cause}"
            ),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    /// Creates an authentication failure, for use by [`Authenticator`](crate::Authenticator)
    /// implementations.
    pub fn authentication(message: impl Into<String>) -> Error {
        ErrorKind::Authentication {
            message: message.into(),
        }
        .into()
    }

    #[cfg(test)]
    pub(crate) fn network_timeout() -> Error {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    /// Whether this error is a "not writable primary" or "node is recovering" error.
    pub fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_notwritableprimary()
    }

    /// If this error corresponds to a "not writable primary" error.
    pub fn is_notwritableprimary(&self) -> bool {
        self.sdam_code()
            .map(|code| NOTWRITABLEPRIMARY_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is recovering" error.
    pub fn is_recovering(&self) -> bool {
        self.sdam_code()
            .map(|code| RECOVERING_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is shutting down" error.
    pub fn is_shutting_down(&self) -> bool {
        self.sdam_code()
            .map(|code| SHUTTING_DOWN_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// Whether this error was caused by the network or by a concurrently cleared pool.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut)
    }

    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() != std::io::ErrorKind::TimedOut)
    }

    pub(crate) fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    pub(crate) fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    /// Whether no server could be selected before the deadline.
    pub fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. })
    }

    /// Whether a connection could not be checked out of a pool before the deadline.
    pub fn is_wait_queue_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::WaitQueueTimeout { .. })
    }

    pub(crate) fn is_pool_cleared(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ConnectionPoolCleared { .. })
    }

    /// Whether the deployment's wire versions are incompatible with this crate.
    pub fn is_incompatible_server(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::IncompatibleServer { .. })
    }

    #[cfg(test)]
    pub(crate) fn is_invalid_argument(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::InvalidArgument { .. })
    }

    /// Gets the code from this error for performing SDAM updates, if applicable.
    pub(crate) fn sdam_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            _ => None,
        }
    }

    /// The topology as it was last observed when server selection failed.
    pub fn topology_description(&self) -> Option<&TopologyDescription> {
        match self.kind.as_ref() {
            ErrorKind::ServerSelection { topology, .. } => Some(topology.as_ref()),
            _ => None,
        }
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<crate::bson::de::Error> for ErrorKind {
    fn from(err: crate::bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// An error occurred while authenticating a newly established connection.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(crate::bson::de::Error),

    /// The server returned an error to an attempted command.
    #[error("Command failed: {0}")]
    Command(CommandError),

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The connection pool for a server was cleared during operation execution due to
    /// a concurrent error, causing the operation to fail.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    /// The server returned an invalid reply to a command.
    #[error("The server returned an invalid reply to a command: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// No server matching the selection criteria became available before the deadline. The last
    /// observed topology is attached for diagnostics.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection {
        message: String,
        topology: Box<TopologyDescription>,
    },

    /// A server was selected but no connection to it could be checked out before the deadline.
    #[error("Timed out while checking out a connection from connection pool with address {address}")]
    #[non_exhaustive]
    WaitQueueTimeout { address: ServerAddress },

    /// The wire version ranges of the deployment and this crate do not overlap.
    #[error("The server does not support a wire version compatible with this crate: {message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// The cluster was shut down.
    #[error("Cluster has been shut down")]
    Shutdown,
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,
}

impl CommandError {
    /// Decode the error carried by a command reply with `ok: 0`, if any.
    pub(crate) fn from_reply(reply: &Document) -> Option<Result<CommandError>> {
        let ok = match reply.get("ok") {
            Some(crate::bson::Bson::Double(f)) => *f != 0.0,
            Some(crate::bson::Bson::Int32(i)) => *i != 0,
            Some(crate::bson::Bson::Int64(i)) => *i != 0,
            Some(crate::bson::Bson::Boolean(b)) => *b,
            _ => return Some(Err(Error::invalid_response("missing or invalid \"ok\" field"))),
        };
        if ok {
            return None;
        }
        Some(crate::bson::from_document(reply.clone()).map_err(Error::from))
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Error code {} ({}): {}", self.code, self.code_name, self.message)
    }
}

#[cfg(test)]
mod test {
    use crate::bson::doc;

    use super::{CommandError, Error, ErrorKind};

    fn command_error(code: i32) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: "TestError".to_string(),
            message: "test".to_string(),
        })
        .into()
    }

    #[test]
    fn state_change_classification() {
        let not_primary = command_error(10107);
        assert!(not_primary.is_notwritableprimary());
        assert!(not_primary.is_state_change_error());
        assert!(!not_primary.is_shutting_down());

        let shutting_down = command_error(91);
        assert!(shutting_down.is_recovering());
        assert!(shutting_down.is_shutting_down());

        let other = command_error(2);
        assert!(!other.is_state_change_error());
        assert!(!other.is_network_error());
    }

    #[test]
    fn network_classification() {
        let io: Error = std::io::ErrorKind::ConnectionReset.into();
        assert!(io.is_network_error());
        assert!(io.is_non_timeout_network_error());
        assert!(!io.is_network_timeout());

        let timeout = Error::network_timeout();
        assert!(timeout.is_network_error());
        assert!(timeout.is_network_timeout());
    }

    #[test]
    fn command_error_from_reply() {
        assert!(CommandError::from_reply(&doc! { "ok": 1 }).is_none());

        let parsed = CommandError::from_reply(&doc! {
            "ok": 0.0,
            "code": 13435,
            "codeName": "NotPrimaryNoSecondaryOk",
            "errmsg": "not primary",
        })
        .expect("reply should carry an error")
        .expect("error should decode");
        assert_eq!(parsed.code, 13435);
        assert_eq!(parsed.code_name, "NotPrimaryNoSecondaryOk");

        assert!(CommandError::from_reply(&doc! { "hello": 1 })
            .expect("missing ok should be reported")
            .is_err());
    }

    #[test]
    fn labels_are_kept() {
        let error = Error::new(
            ErrorKind::Internal {
                message: "test".to_string(),
            },
            Some(vec!["RetryableWriteError".to_string()]),
        );
        assert!(error.contains_label("RetryableWriteError"));
        assert!(!error.contains_label("TransientTransactionError"));
        assert_eq!(error.labels().len(), 1);

        let auth = Error::authentication("bad credentials");
        assert!(auth.is_auth_error());
        assert!(auth.labels().is_empty());
    }
}
