//! Contains the events and functionality for monitoring the behavior of connection pools.

use std::time::Duration;

use crate::{bson::oid::ObjectId, error::Error, options::ServerAddress};

/// The options a connection pool was created with.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct ConnectionPoolOptions {
    /// The maximum number of connections the pool manages, including those checked out.
    pub max_pool_size: Option<u32>,

    /// The number of connections the pool keeps open while ready.
    pub min_pool_size: Option<u32>,

    /// How long a connection may stay idle before being closed.
    pub max_idle_time: Option<Duration>,
}

/// Event emitted when a connection pool is created.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,

    /// The options used for the pool.
    pub options: Option<ConnectionPoolOptions>,
}

/// Event emitted when a connection pool becomes ready.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct PoolReadyEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection pool is cleared.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct PoolClearedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,

    /// The generation the pool moved to.
    pub generation: u32,
}

/// Event emitted when a connection pool is closed.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct PoolClosedEvent {
    /// The address of the server that the pool's connections connected to.
    pub address: ServerAddress,
}

/// Event emitted when a connection is created.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection. This is not used for anything internally, but can be used
    /// to identify other events related to this connection.
    pub connection_id: u32,
}

/// Event emitted when a connection is ready to be used.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionReadyEvent {
    /// The address of the server that the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The time it took to establish the connection.
    pub duration: Duration,
}

/// Event emitted when a connection is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The reason that the connection was closed.
    pub reason: ConnectionClosedReason,

    /// The error that caused the connection to close, if any.
    pub error: Option<Error>,
}

/// The reasons that a connection may be closed.
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The connection was created before the pool's current generation.
    Stale,

    /// The connection has been idle for longer than the pool's max idle time.
    Idle,

    /// An error occurred while using the connection.
    Error,

    /// The pool the connection belonged to was closed.
    PoolClosed,
}

/// Event emitted when a thread begins checking out a connection to use for an operation.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionCheckoutStartedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a thread is unable to check out a connection.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckoutFailedEvent {
    /// The address of the server that the connection would have connected to.
    pub address: ServerAddress,

    /// The reason a connection was unable to be checked out.
    pub reason: ConnectionCheckoutFailedReason,

    /// The error that caused the checkout to fail, if any.
    pub error: Option<Error>,
}

/// The reasons a connection may not be able to be checked out.
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub enum ConnectionCheckoutFailedReason {
    /// The deadline elapsed while waiting for a connection.
    Timeout,

    /// An error occurred while trying to establish a new connection.
    ConnectionError,

    /// The pool was cleared or paused while the request was pending.
    PoolCleared,
}

/// Event emitted when a connection is successfully checked out.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionCheckedOutEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,
}

/// Event emitted when a connection is checked back into a connection pool.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionCheckedInEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,
}

#[derive(Clone, Debug)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum CmapEvent {
    PoolCreated(PoolCreatedEvent),
    PoolReady(PoolReadyEvent),
    PoolCleared(PoolClearedEvent),
    PoolClosed(PoolClosedEvent),
    ConnectionCreated(ConnectionCreatedEvent),
    ConnectionReady(ConnectionReadyEvent),
    ConnectionClosed(ConnectionClosedEvent),
    ConnectionCheckoutStarted(ConnectionCheckoutStartedEvent),
    ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent),
    ConnectionCheckedOut(ConnectionCheckedOutEvent),
    ConnectionCheckedIn(ConnectionCheckedInEvent),
}

impl CmapEvent {
    pub(crate) fn dispatch(self, handler: &dyn CmapEventHandler) {
        match self {
            Self::PoolCreated(e) => handler.handle_pool_created_event(e),
            Self::PoolReady(e) => handler.handle_pool_ready_event(e),
            Self::PoolCleared(e) => handler.handle_pool_cleared_event(e),
            Self::PoolClosed(e) => handler.handle_pool_closed_event(e),
            Self::ConnectionCreated(e) => handler.handle_connection_created_event(e),
            Self::ConnectionReady(e) => handler.handle_connection_ready_event(e),
            Self::ConnectionClosed(e) => handler.handle_connection_closed_event(e),
            Self::ConnectionCheckoutStarted(e) => handler.handle_connection_checkout_started_event(e),
            Self::ConnectionCheckoutFailed(e) => handler.handle_connection_checkout_failed_event(e),
            Self::ConnectionCheckedOut(e) => handler.handle_connection_checked_out_event(e),
            Self::ConnectionCheckedIn(e) => handler.handle_connection_checked_in_event(e),
        }
    }
}

/// Applications can implement this trait to specify custom logic to run on each CMAP event.
pub trait CmapEventHandler: Send + Sync {
    /// Called when a connection pool is created.
    fn handle_pool_created_event(&self, _event: PoolCreatedEvent) {}

    /// Called when a connection pool is marked as ready for use.
    fn handle_pool_ready_event(&self, _event: PoolReadyEvent) {}

    /// Called when a connection pool is cleared.
    fn handle_pool_cleared_event(&self, _event: PoolClearedEvent) {}

    /// Called when a connection pool is closed.
    fn handle_pool_closed_event(&self, _event: PoolClosedEvent) {}

    /// Called when a connection is created.
    fn handle_connection_created_event(&self, _event: ConnectionCreatedEvent) {}

    /// Called when a connection is ready to be used.
    fn handle_connection_ready_event(&self, _event: ConnectionReadyEvent) {}

    /// Called when a connection is closed.
    fn handle_connection_closed_event(&self, _event: ConnectionClosedEvent) {}

    /// Called when a checkout attempt starts.
    fn handle_connection_checkout_started_event(&self, _event: ConnectionCheckoutStartedEvent) {}

    /// Called when a checkout attempt fails.
    fn handle_connection_checkout_failed_event(&self, _event: ConnectionCheckoutFailedEvent) {}

    /// Called when a connection is successfully checked out.
    fn handle_connection_checked_out_event(&self, _event: ConnectionCheckedOutEvent) {}

    /// Called when a connection is checked back into a pool.
    fn handle_connection_checked_in_event(&self, _event: ConnectionCheckedInEvent) {}
}

/// Sends CMAP events to the configured handler and to the tracing emitter.
#[derive(Clone)]
pub(crate) struct CmapEventEmitter {
    handler: Option<std::sync::Arc<dyn CmapEventHandler>>,
    tracing_emitter: crate::trace::connection::ConnectionTracingEventEmitter,
}

impl CmapEventEmitter {
    pub(crate) fn new(
        handler: Option<std::sync::Arc<dyn CmapEventHandler>>,
        topology_id: ObjectId,
    ) -> Self {
        Self {
            handler,
            tracing_emitter: crate::trace::connection::ConnectionTracingEventEmitter::new(
                topology_id,
            ),
        }
    }

    /// Emits the event built by `generate_event`. The event is only constructed when a handler
    /// is registered or connection tracing is enabled.
    pub(crate) fn emit_event(&self, generate_event: impl FnOnce() -> CmapEvent) {
        let tracing_enabled = crate::trace::trace_or_log_enabled!(
            target: crate::trace::CONNECTION_TRACING_EVENT_TARGET,
            crate::trace::TracingOrLogLevel::Debug
        );
        if self.handler.is_none() && !tracing_enabled {
            return;
        }

        let event = generate_event();
        if tracing_enabled {
            self.tracing_emitter.handle(event.clone());
        }
        if let Some(ref handler) = self.handler {
            event.dispatch(handler.as_ref());
        }
    }
}
