#[cfg(test)]
mod test;

pub(crate) mod conn;
mod connection_requester;
pub(crate) mod establish;
mod manager;
mod worker;

use std::time::Duration;

use derive_where::derive_where;
use tokio::sync::watch;

pub use self::{
    conn::{Connection, StreamDescription},
    establish::Authenticator,
};
use self::{
    connection_requester::{ConnectionRequestResult, ConnectionRequester},
    establish::ConnectionEstablisher,
    manager::PoolManager,
    worker::ConnectionPoolWorker,
};
use crate::{
    bson::oid::ObjectId,
    error::{Error, ErrorKind, Result},
    event::cmap::{
        CmapEvent,
        CmapEventEmitter,
        ConnectionCheckoutFailedEvent,
        ConnectionCheckoutFailedReason,
        ConnectionCheckoutStartedEvent,
        ConnectionPoolOptions,
        PoolCreatedEvent,
    },
    options::{ClusterOptions, ServerAddress},
    runtime::{self, AcknowledgmentReceiver},
    sdam::TopologyUpdater,
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// A pool of connections to a single server.
/// This type is actually a handle to task that manages the connections and is cheap to clone and
/// pass around.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    connection_requester: ConnectionRequester,
    generation: watch::Receiver<u32>,

    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,
}

impl ConnectionPool {
    /// Creates the pool and starts its worker. The pool starts out paused.
    pub(crate) fn new(
        address: ServerAddress,
        connection_establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        topology_id: ObjectId,
        options: &ClusterOptions,
    ) -> Self {
        let event_emitter = CmapEventEmitter::new(options.cmap_event_handler.clone(), topology_id);

        let (manager, connection_requester, generation) = ConnectionPoolWorker::start(
            address.clone(),
            connection_establisher,
            server_updater,
            event_emitter.clone(),
            options,
        );

        event_emitter.emit_event(|| {
            CmapEvent::PoolCreated(PoolCreatedEvent {
                address: address.clone(),
                options: Some(ConnectionPoolOptions {
                    max_pool_size: options.max_pool_size,
                    min_pool_size: options.min_pool_size,
                    max_idle_time: options.max_idle_time,
                }),
            })
        });

        Self {
            address,
            manager,
            connection_requester,
            generation,
            event_emitter,
        }
    }

    /// Creates a pool with no worker behind it. Checkouts from it never complete.
    #[cfg(test)]
    pub(crate) fn new_mocked(address: ServerAddress) -> Self {
        let (manager, _) = manager::channel();
        let (handle, _) = crate::runtime::WorkerHandleListener::channel();
        let (connection_requester, _) = connection_requester::channel(handle);
        let (_, generation) = watch::channel(0);

        Self {
            address,
            manager,
            connection_requester,
            generation,
            event_emitter: CmapEventEmitter::new(None, ObjectId::new()),
        }
    }

    /// Checks out a connection from the pool, establishing a new one if none are available and
    /// the pool is below its maximum size. When the pool is full the request waits in line for
    /// a connection to be checked back in. Fails with a wait queue timeout if `timeout` elapses
    /// first.
    pub(crate) async fn check_out(&self, timeout: Option<Duration>) -> Result<Connection> {
        self.event_emitter.emit_event(|| {
            CmapEvent::ConnectionCheckoutStarted(ConnectionCheckoutStartedEvent {
                address: self.address.clone(),
            })
        });

        let acquire = async {
            let conn = match self.connection_requester.request().await {
                ConnectionRequestResult::Pooled(c) => *c,
                ConnectionRequestResult::Establishing(task) => match task.await {
                    Ok(Ok(c)) => c,
                    Ok(Err(e)) => return Err(e),
                    Err(join_error) => {
                        return Err(Error::internal(format!(
                            "connection establishment task failed: {join_error}"
                        )))
                    }
                },
                ConnectionRequestResult::PoolCleared(e) => {
                    return Err(Error::pool_cleared_error(&self.address, &e))
                }
            };

            // A connection that finished establishing after a clear must not be handed out.
            // Dropping it checks it back in, where it is closed as stale.
            if conn.is_stale(self.generation()) {
                return Err(Error::pool_cleared_error(
                    &self.address,
                    &Error::internal("the pool was cleared while the connection was established"),
                ));
            }

            Ok(conn)
        };

        let conn = match timeout {
            Some(timeout) => runtime::timeout(timeout, acquire)
                .await
                .unwrap_or_else(|_| {
                    Err(ErrorKind::WaitQueueTimeout {
                        address: self.address.clone(),
                    }
                    .into())
                }),
            None => acquire.await,
        };

        match conn {
            Ok(ref conn) => {
                self.event_emitter
                    .emit_event(|| CmapEvent::ConnectionCheckedOut(conn.checked_out_event()));
            }
            Err(ref err) => {
                let reason = if err.is_wait_queue_timeout() {
                    ConnectionCheckoutFailedReason::Timeout
                } else if err.is_pool_cleared() {
                    ConnectionCheckoutFailedReason::PoolCleared
                } else {
                    ConnectionCheckoutFailedReason::ConnectionError
                };
                self.event_emitter.emit_event(|| {
                    CmapEvent::ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent {
                        address: self.address.clone(),
                        reason,
                        error: Some(err.clone()),
                    })
                });
            }
        }

        conn
    }

    /// Increments the generation of the pool and pauses it. Idle connections are closed right
    /// away when `cause` is a network error, and lazily otherwise.
    pub(crate) async fn clear(&self, cause: Error) {
        self.manager.clear(cause).await
    }

    /// Mark the pool as "ready", allowing checkouts and background connection creation.
    pub(crate) fn mark_as_ready(&self) -> AcknowledgmentReceiver<()> {
        self.manager.mark_as_ready()
    }

    pub(crate) fn generation(&self) -> u32 {
        *self.generation.borrow()
    }
}
