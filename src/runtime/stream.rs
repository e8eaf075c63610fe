//! The transport seam. Encoding commands onto the wire is left to implementors of [`Connector`]
//! and [`CommandStream`]; this crate only needs to open a stream to an address and exchange
//! command documents over it.

use futures_util::future::BoxFuture;

use crate::{bson::Document, error::Result, options::ServerAddress};

/// Opens command streams to servers.
///
/// One `Connector` is shared by every monitor and connection pool of a
/// [`Cluster`](crate::Cluster).
pub trait Connector: Send + Sync + 'static {
    /// Opens a new stream to `address`. Connect timeouts are applied by the caller.
    fn connect<'a>(
        &'a self,
        address: &'a ServerAddress,
    ) -> BoxFuture<'a, Result<Box<dyn CommandStream>>>;
}

/// A bidirectional stream carrying one command at a time.
pub trait CommandStream: Send + Sync + 'static {
    /// Sends `command` and waits for its reply. Network failures are reported as
    /// [`ErrorKind::Io`](crate::error::ErrorKind::Io); a reply with `ok: 0` is returned as-is.
    fn send_command<'a>(&'a mut self, command: Document) -> BoxFuture<'a, Result<Document>>;
}
