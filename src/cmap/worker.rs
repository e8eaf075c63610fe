use derive_where::derive_where;

use std::{collections::VecDeque, time::Duration};

use tokio::{sync::watch, task::JoinHandle};

use super::{
    conn::PendingConnection,
    connection_requester,
    connection_requester::{
        ConnectionRequest,
        ConnectionRequestReceiver,
        ConnectionRequestResult,
        ConnectionRequester,
    },
    establish::ConnectionEstablisher,
    manager,
    manager::{ManagementRequestReceiver, PoolManagementRequest, PoolManager},
    Connection,
    DEFAULT_MAX_POOL_SIZE,
};
use crate::{
    error::{Error, Result},
    event::cmap::{
        CmapEvent,
        CmapEventEmitter,
        ConnectionClosedReason,
        PoolClearedEvent,
        PoolClosedEvent,
        PoolReadyEvent,
    },
    options::{ClusterOptions, ServerAddress},
    runtime::{self, WorkerHandleListener},
    sdam::TopologyUpdater,
};

/// How many connections a pool may be establishing at once.
const MAX_CONNECTING: u32 = 2;

const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// Size and lifetime bounds of a pool, resolved from the cluster options.
#[derive(Clone, Copy, Debug)]
struct PoolLimits {
    min_size: u32,
    max_size: u32,
    /// `None` when idle connections are kept forever.
    max_idle_time: Option<Duration>,
}

impl PoolLimits {
    fn new(options: &ClusterOptions) -> Self {
        Self {
            min_size: options.min_pool_size.unwrap_or(0),
            // Zero lifts the bound.
            max_size: match options.max_pool_size {
                Some(0) => u32::MAX,
                Some(max_size) => max_size,
                None => DEFAULT_MAX_POOL_SIZE,
            },
            // Zero keeps idle connections forever.
            max_idle_time: options.max_idle_time.filter(|d| !d.is_zero()),
        }
    }
}

/// Connection bookkeeping. `total` counts every connection the pool is responsible for, whether
/// idle, checked out or still being established.
#[derive(Debug, Default)]
struct ConnectionCounts {
    total: u32,
    establishing: u32,
    next_id: u32,
}

impl ConnectionCounts {
    fn may_establish(&self, limit: u32) -> bool {
        self.total < limit && self.establishing < MAX_CONNECTING
    }

    /// Reserves a slot for a new connection and returns its id.
    fn begin_establishing(&mut self) -> u32 {
        self.total += 1;
        self.establishing += 1;
        self.next_id += 1;
        self.next_id
    }

    fn finish_establishing(&mut self) {
        self.establishing = self.establishing.saturating_sub(1);
    }

    fn release(&mut self) {
        self.total = self.total.saturating_sub(1);
    }
}

/// Whether a pool hands out connections. Closing is not a state: the pool closes when its
/// worker stops.
#[derive(Debug)]
enum PoolState {
    /// Checkouts fail with the error that paused the pool, and no connections are opened in
    /// the background.
    Paused(Error),

    Ready,
}

/// The single task that owns a pool's connections, wait queue and counters. Every change to
/// them goes through this worker, so none of them need locking.
#[derive_where(Debug)]
pub(crate) struct ConnectionPoolWorker {
    address: ServerAddress,
    state: PoolState,
    limits: PoolLimits,
    counts: ConnectionCounts,

    /// Bumped on every clear. Connections from an older generation are closed instead of reused.
    generation: u32,

    /// Idle connections. The least recently used is at the front, so checkouts take from the
    /// back and reaping starts at the front.
    idle: VecDeque<Connection>,

    /// Checkouts waiting for a connection, served first come first served.
    wait_queue: VecDeque<ConnectionRequest>,

    #[derive_where(skip)]
    establisher: ConnectionEstablisher,

    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,

    /// Fires once every requester is gone, which closes the pool.
    handle_listener: WorkerHandleListener,

    request_receiver: ConnectionRequestReceiver,
    management_receiver: ManagementRequestReceiver,
    generation_publisher: watch::Sender<u32>,

    /// Handed to checked out connections so that dropping them checks them back in.
    manager: PoolManager,

    /// Reports establishment failures, which may mark the server Unknown.
    server_updater: TopologyUpdater,
}

/// What woke the worker up.
#[derive(Debug)]
enum PoolTask {
    Manage(PoolManagementRequest),
    CheckOut(ConnectionRequest),
    Maintain,
}

impl ConnectionPoolWorker {
    /// Spawns the worker for the pool of `address`. It runs until every returned requester has
    /// been dropped, then closes its idle connections.
    pub(super) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        event_emitter: CmapEventEmitter,
        options: &ClusterOptions,
    ) -> (PoolManager, ConnectionRequester, watch::Receiver<u32>) {
        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (connection_requester, request_receiver) = connection_requester::channel(handle);
        let (manager, management_receiver) = manager::channel();
        let (generation_publisher, generation_subscriber) = watch::channel(0);

        let worker = ConnectionPoolWorker {
            address,
            state: PoolState::Paused(Error::internal(
                "connection pool has not been marked ready",
            )),
            limits: PoolLimits::new(options),
            counts: ConnectionCounts::default(),
            generation: 0,
            idle: VecDeque::new(),
            wait_queue: VecDeque::new(),
            establisher,
            event_emitter,
            handle_listener,
            request_receiver,
            management_receiver,
            generation_publisher,
            manager: manager.clone(),
            server_updater,
        };
        runtime::execute(worker.execute());

        (manager, connection_requester, generation_subscriber)
    }

    async fn execute(mut self) {
        let mut maintenance_interval = runtime::interval(MAINTENANCE_FREQUENCY);

        loop {
            let task = tokio::select! {
                // A pool marked ready before a checkout was requested must be ready by the time
                // that checkout is handled.
                biased;

                Some(request) = self.management_receiver.recv() => PoolTask::Manage(request),
                Some(request) = self.request_receiver.recv() => PoolTask::CheckOut(request),
                _ = self.handle_listener.wait_for_all_handle_drops() => break,
                _ = maintenance_interval.tick() => PoolTask::Maintain,
                else => break,
            };

            match task {
                PoolTask::CheckOut(request) => self.enqueue(request),
                PoolTask::Manage(request) => self.manage(request),
                PoolTask::Maintain => self.maintain(),
            }
            self.serve_wait_queue();
        }

        while let Some(connection) = self.idle.pop_front() {
            connection.close_and_drop(ConnectionClosedReason::PoolClosed);
        }
        self.event_emitter.emit_event(|| {
            CmapEvent::PoolClosed(PoolClosedEvent {
                address: self.address.clone(),
            })
        });
    }

    fn enqueue(&mut self, request: ConnectionRequest) {
        match self.state {
            PoolState::Ready => self.wait_queue.push_back(request),
            PoolState::Paused(ref cause) => {
                // The requester may have given up already.
                let _: std::result::Result<_, _> =
                    request.fulfill(ConnectionRequestResult::PoolCleared(cause.clone()));
            }
        }
    }

    fn manage(&mut self, request: PoolManagementRequest) {
        match request {
            PoolManagementRequest::CheckIn(connection) => self.check_in(*connection),
            PoolManagementRequest::Clear { cause, .. } => self.clear(cause),
            PoolManagementRequest::MarkAsReady { completion_handler } => {
                self.mark_as_ready();
                completion_handler.acknowledge(());
            }
            PoolManagementRequest::HandleConnectionSucceeded(connection) => {
                self.counts.finish_establishing();
                if let Some(connection) = connection {
                    self.make_idle(*connection);
                }
            }
            PoolManagementRequest::HandleConnectionFailed => {
                self.counts.finish_establishing();
                self.counts.release();
            }
        }
    }

    /// Hands out connections to waiters for as long as the pool can.
    fn serve_wait_queue(&mut self) {
        while matches!(self.state, PoolState::Ready) {
            if self.idle.is_empty() && !self.counts.may_establish(self.limits.max_size) {
                return;
            }
            let request = match self.wait_queue.pop_front() {
                Some(request) if request.is_abandoned() => continue,
                Some(request) => request,
                None => return,
            };
            if let Err(request) = self.check_out(request) {
                self.wait_queue.push_front(request);
                return;
            }
        }
    }

    /// Fulfills `request` with the most recently used usable idle connection, or with a new one
    /// when none is left. Hands the request back when neither is possible.
    fn check_out(
        &mut self,
        request: ConnectionRequest,
    ) -> std::result::Result<(), ConnectionRequest> {
        while let Some(mut connection) = self.idle.pop_back() {
            if let Some(reason) = self.unusable_reason(&connection) {
                self.close_connection(connection, reason);
                continue;
            }

            connection.mark_as_in_use(self.manager.clone());
            if let Err(ConnectionRequestResult::Pooled(mut connection)) =
                request.fulfill(ConnectionRequestResult::Pooled(Box::new(connection)))
            {
                // The requester hit its deadline in the meantime.
                connection.mark_as_available();
                self.idle.push_back(*connection);
            }
            return Ok(());
        }

        if !self.counts.may_establish(self.limits.max_size) {
            return Err(request);
        }

        let task = self.begin_establishing().for_check_out();
        // A requester that gave up lets the connection finish in the background.
        let _: std::result::Result<_, _> =
            request.fulfill(ConnectionRequestResult::Establishing(task));
        Ok(())
    }

    fn check_in(&mut self, connection: Connection) {
        self.event_emitter
            .emit_event(|| CmapEvent::ConnectionCheckedIn(connection.checked_in_event()));
        self.make_idle(connection);
    }

    /// Returns `connection` to the idle queue unless it can no longer be used.
    fn make_idle(&mut self, mut connection: Connection) {
        connection.mark_as_available();
        match self.unusable_reason(&connection) {
            Some(reason) => self.close_connection(connection, reason),
            None => self.idle.push_back(connection),
        }
    }

    fn unusable_reason(&self, connection: &Connection) -> Option<ConnectionClosedReason> {
        if connection.has_errored() {
            Some(ConnectionClosedReason::Error)
        } else if connection.is_stale(self.generation) {
            Some(ConnectionClosedReason::Stale)
        } else if connection.is_idle(self.limits.max_idle_time) {
            Some(ConnectionClosedReason::Idle)
        } else {
            None
        }
    }

    fn close_connection(&mut self, connection: Connection, reason: ConnectionClosedReason) {
        connection.close_and_drop(reason);
        self.counts.release();
    }

    /// Starts a new generation and pauses the pool. Idle connections are closed now when `cause`
    /// is a network error, and lazily otherwise.
    fn clear(&mut self, cause: Error) {
        self.generation += 1;
        self.generation_publisher.send_replace(self.generation);
        let was_ready = matches!(
            std::mem::replace(&mut self.state, PoolState::Paused(cause.clone())),
            PoolState::Ready
        );

        if cause.is_network_error() {
            while let Some(connection) = self.idle.pop_front() {
                self.close_connection(connection, ConnectionClosedReason::Stale);
            }
        }

        if was_ready {
            self.event_emitter.emit_event(|| {
                CmapEvent::PoolCleared(PoolClearedEvent {
                    address: self.address.clone(),
                    generation: self.generation,
                })
            });
            for request in self.wait_queue.drain(..) {
                let _: std::result::Result<_, _> =
                    request.fulfill(ConnectionRequestResult::PoolCleared(cause.clone()));
            }
        }
    }

    fn mark_as_ready(&mut self) {
        if let PoolState::Paused(_) = self.state {
            self.state = PoolState::Ready;
            self.event_emitter.emit_event(|| {
                CmapEvent::PoolReady(PoolReadyEvent {
                    address: self.address.clone(),
                })
            });
        }
    }

    /// Reaps perished connections from the least recently used end, then tops the pool up to
    /// its minimum size while it is ready.
    fn maintain(&mut self) {
        while let Some(connection) = self.idle.pop_front() {
            match self.unusable_reason(&connection) {
                Some(reason) => self.close_connection(connection, reason),
                None => {
                    // Everything behind it was checked in later.
                    self.idle.push_front(connection);
                    break;
                }
            }
        }

        if matches!(self.state, PoolState::Ready) {
            while self.counts.total < self.limits.min_size
                && self.counts.may_establish(self.limits.max_size)
            {
                runtime::execute(self.begin_establishing().for_pool());
            }
        }
    }

    fn begin_establishing(&mut self) -> Establishment {
        let pending = PendingConnection {
            id: self.counts.begin_establishing(),
            address: self.address.clone(),
            generation: self.generation,
            event_emitter: self.event_emitter.clone(),
            time_created: std::time::Instant::now(),
        };
        self.event_emitter
            .emit_event(|| CmapEvent::ConnectionCreated(pending.created_event()));

        Establishment {
            pending,
            establisher: self.establisher.clone(),
            manager: self.manager.clone(),
            server_updater: self.server_updater.clone(),
        }
    }
}

/// A connection the worker has reserved a slot for, to be established off the worker task.
struct Establishment {
    pending: PendingConnection,
    establisher: ConnectionEstablisher,
    manager: PoolManager,
    server_updater: TopologyUpdater,
}

impl Establishment {
    /// Establishes the connection for a waiting checkout and hands it out already in use.
    fn for_check_out(self) -> JoinHandle<Result<Connection>> {
        runtime::spawn(async move {
            let manager = self.manager.clone();
            let mut connection = self.establish().await?;
            connection.mark_as_in_use(manager.clone());
            manager.handle_connection_succeeded(None);
            Ok(connection)
        })
    }

    /// Establishes a connection that goes straight to the idle queue.
    async fn for_pool(self) {
        let manager = self.manager.clone();
        if let Ok(connection) = self.establish().await {
            manager.handle_connection_succeeded(Some(connection));
        }
    }

    /// Failures are reported to the topology and release the reserved slot.
    async fn establish(self) -> Result<Connection> {
        let pending = self.pending.clone();
        match self.establisher.establish_connection(self.pending).await {
            Ok(connection) => {
                pending
                    .event_emitter
                    .emit_event(|| CmapEvent::ConnectionReady(connection.ready_event()));
                Ok(connection)
            }
            Err(error) => {
                pending.emit_failed_event(&error.cause);
                self.server_updater
                    .handle_application_error(
                        pending.address,
                        error.cause.clone(),
                        error.handshake_phase,
                    )
                    .await;
                self.manager.handle_connection_failed();
                Err(error.cause)
            }
        }
    }
}
