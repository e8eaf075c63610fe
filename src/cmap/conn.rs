mod stream_description;

use std::time::{Duration, Instant};

use derive_where::derive_where;

pub use self::stream_description::StreamDescription;
use super::manager::PoolManager;
use crate::{
    bson::{Bson, Document},
    error::{CommandError, Error, ErrorKind, Result},
    event::cmap::{
        CmapEvent,
        CmapEventEmitter,
        ConnectionCheckedInEvent,
        ConnectionCheckedOutEvent,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        ConnectionCreatedEvent,
        ConnectionReadyEvent,
    },
    options::ServerAddress,
    runtime::stream::CommandStream,
};

/// A connection to a server, either owned by a monitor or checked out of a server's pool.
///
/// A pooled connection returns itself to its pool when dropped.
#[derive_where(Debug)]
pub struct Connection {
    /// Driver-generated ID for the connection. Monitoring connections use zero.
    pub(crate) id: u32,

    pub(crate) address: ServerAddress,

    /// The pool generation the connection was created in.
    pub(crate) generation: u32,

    pub(crate) time_created: Instant,

    /// Set once the `hello` handshake has completed.
    pub(crate) stream_description: Option<StreamDescription>,

    /// Whether a network error occurred on this connection. Errored connections are closed
    /// rather than returned to the pool.
    errored: bool,

    /// Marks the time when the connection was last checked into the pool. This value can be used
    /// to determine whether this connection is idle.
    ready_and_available_time: Option<Instant>,

    /// The manager used to check this connection back into the pool when dropped. This value is
    /// unset while the connection is checked into the pool.
    pool_manager: Option<PoolManager>,

    #[derive_where(skip)]
    stream: Option<Box<dyn CommandStream>>,

    /// Emitter for the events of pooled connections.
    #[derive_where(skip)]
    event_emitter: Option<CmapEventEmitter>,
}

impl Connection {
    pub(crate) fn new(pending_connection: PendingConnection, stream: Box<dyn CommandStream>) -> Self {
        Self {
            id: pending_connection.id,
            address: pending_connection.address,
            generation: pending_connection.generation,
            time_created: pending_connection.time_created,
            stream_description: None,
            errored: false,
            ready_and_available_time: None,
            pool_manager: None,
            stream: Some(stream),
            event_emitter: Some(pending_connection.event_emitter),
        }
    }

    /// Creates a connection owned by a monitor. It belongs to no pool and emits no CMAP events.
    pub(crate) fn new_monitoring(address: ServerAddress, stream: Box<dyn CommandStream>) -> Self {
        Self {
            id: 0,
            address,
            generation: 0,
            time_created: Instant::now(),
            stream_description: None,
            errored: false,
            ready_and_available_time: None,
            pool_manager: None,
            stream: Some(stream),
            event_emitter: None,
        }
    }

    /// The pool-assigned ID of this connection.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The address of the server this connection is connected to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The generation of the pool at the time this connection was created.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Information about the server gathered during the handshake.
    pub fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            Error::internal(format!(
                "stream description of connection {} to {} accessed before handshake",
                self.id, self.address
            ))
        })
    }

    /// Sends `command` and returns the server's reply. A reply with `ok: 0` is returned as a
    /// command error; any failure of the stream itself marks the connection as errored.
    pub async fn send_command(&mut self, command: Document) -> Result<Document> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => {
                return Err(Error::internal(format!(
                    "connection {} to {} has no stream",
                    self.id, self.address
                )))
            }
        };

        let reply = match stream.send_command(command).await {
            Ok(reply) => reply,
            Err(error) => {
                self.errored = true;
                return Err(error);
            }
        };

        match CommandError::from_reply(&reply) {
            None => Ok(reply),
            Some(Ok(command_error)) => Err(Error::new(
                ErrorKind::Command(command_error),
                Some(error_labels(&reply)),
            )),
            Some(Err(error)) => Err(error),
        }
    }

    /// Whether a network error has occurred on this connection.
    pub fn has_errored(&self) -> bool {
        self.errored
    }

    /// Updates the state of the connection to indicate that it is checked into the pool.
    pub(crate) fn mark_as_available(&mut self) {
        self.pool_manager.take();
        self.ready_and_available_time = Some(Instant::now());
    }

    /// Updates the state of the connection to indicate that it is checked out of the pool.
    pub(crate) fn mark_as_in_use(&mut self, manager: PoolManager) {
        self.pool_manager = Some(manager);
        self.ready_and_available_time.take();
    }

    /// Whether this connection has sat in the pool for at least `max_idle_time`.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        self.ready_and_available_time
            .and_then(|ready_and_available_time| {
                max_idle_time.map(|max_idle_time| {
                    Instant::now().duration_since(ready_and_available_time) >= max_idle_time
                })
            })
            .unwrap_or(false)
    }

    /// Whether the connection was created before the pool's current generation.
    pub(crate) fn is_stale(&self, current_generation: u32) -> bool {
        self.generation != current_generation
    }

    /// Nullify the inner state and return it in a new `Connection` for checking back in to the
    /// pool.
    fn take(&mut self) -> Connection {
        Connection {
            id: self.id,
            address: self.address.clone(),
            generation: self.generation,
            time_created: self.time_created,
            stream_description: self.stream_description.take(),
            errored: self.errored,
            ready_and_available_time: None,
            pool_manager: None,
            stream: self.stream.take(),
            event_emitter: self.event_emitter.clone(),
        }
    }

    /// Close this connection, emitting a [`ConnectionClosedEvent`] with the supplied reason.
    pub(crate) fn close_and_drop(mut self, reason: ConnectionClosedReason) {
        self.close(reason);
    }

    fn close(&mut self, reason: ConnectionClosedReason) {
        self.pool_manager.take();
        self.stream.take();
        if let Some(ref event_emitter) = self.event_emitter {
            event_emitter.emit_event(|| CmapEvent::ConnectionClosed(self.closed_event(reason)));
        }
    }

    pub(crate) fn checked_out_event(&self) -> ConnectionCheckedOutEvent {
        ConnectionCheckedOutEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    pub(crate) fn checked_in_event(&self) -> ConnectionCheckedInEvent {
        ConnectionCheckedInEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    pub(crate) fn ready_event(&self) -> ConnectionReadyEvent {
        ConnectionReadyEvent {
            address: self.address.clone(),
            connection_id: self.id,
            duration: Instant::now() - self.time_created,
        }
    }

    fn closed_event(&self, reason: ConnectionClosedReason) -> ConnectionClosedEvent {
        ConnectionClosedEvent {
            address: self.address.clone(),
            connection_id: self.id,
            reason,
            error: None,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // A connection with a pool manager is checked out: it goes back to the pool, or closes
        // itself if the pool is gone. Connections without one were either closed explicitly by
        // the pool or belong to a monitor.
        if let Some(pool_manager) = self.pool_manager.take() {
            let dropped_connection = self.take();
            if let Err(mut connection) = pool_manager.check_in(dropped_connection) {
                connection.close(ConnectionClosedReason::PoolClosed);
            }
        }
    }
}

/// Collects the `errorLabels` array of a command reply.
fn error_labels(reply: &Document) -> Vec<String> {
    match reply.get("errorLabels") {
        Some(Bson::Array(labels)) => labels
            .iter()
            .filter_map(|label| label.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

/// Struct encapsulating the information needed to establish a new pooled connection.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,
    #[derive_where(skip)]
    pub(crate) event_emitter: CmapEventEmitter,
    pub(crate) time_created: Instant,
}

impl PendingConnection {
    pub(crate) fn created_event(&self) -> ConnectionCreatedEvent {
        ConnectionCreatedEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    /// Emits the closed event for a connection that failed to establish.
    pub(crate) fn emit_failed_event(&self, error: &Error) {
        self.event_emitter.emit_event(|| {
            CmapEvent::ConnectionClosed(ConnectionClosedEvent {
                address: self.address.clone(),
                connection_id: self.id,
                reason: ConnectionClosedReason::Error,
                error: Some(error.clone()),
            })
        });
    }
}
