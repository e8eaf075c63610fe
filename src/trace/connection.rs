use crate::{
    bson::oid::ObjectId,
    event::cmap::{CmapEvent, ConnectionCheckoutFailedReason, ConnectionClosedReason},
    options::ServerAddress,
    trace::{TracingRepresentation, CONNECTION_TRACING_EVENT_TARGET},
};

/// Renders pool events as `tracing` records under the connection target.
#[derive(Clone)]
pub(crate) struct ConnectionTracingEventEmitter {
    topology_id: ObjectId,
}

/// The fields shared by every pool record, plus the optional per-event extras.
struct PoolRecord<'a> {
    address: &'a ServerAddress,
    message: &'static str,
    connection_id: Option<u32>,
    reason: Option<&'static str>,
    error: Option<String>,
    duration_ms: Option<u128>,
    generation: Option<u32>,
}

impl<'a> PoolRecord<'a> {
    fn new(address: &'a ServerAddress, message: &'static str) -> Self {
        Self {
            address,
            message,
            connection_id: None,
            reason: None,
            error: None,
            duration_ms: None,
            generation: None,
        }
    }

    fn connection(mut self, id: u32) -> Self {
        self.connection_id = Some(id);
        self
    }
}

impl ConnectionTracingEventEmitter {
    pub(crate) fn new(topology_id: ObjectId) -> ConnectionTracingEventEmitter {
        Self { topology_id }
    }

    pub(crate) fn handle(&self, event: CmapEvent) {
        match event {
            CmapEvent::PoolCreated(event) => {
                let options = event.options.unwrap_or_default();
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    maxIdleTimeMS = options.max_idle_time.map(|d| d.as_millis()),
                    maxPoolSize = options.max_pool_size,
                    minPoolSize = options.min_pool_size,
                    "Connection pool created",
                );
            }
            CmapEvent::PoolReady(event) => {
                self.record(PoolRecord::new(&event.address, "Connection pool ready"))
            }
            CmapEvent::PoolCleared(event) => self.record(PoolRecord {
                generation: Some(event.generation),
                ..PoolRecord::new(&event.address, "Connection pool cleared")
            }),
            CmapEvent::PoolClosed(event) => {
                self.record(PoolRecord::new(&event.address, "Connection pool closed"))
            }
            CmapEvent::ConnectionCreated(event) => self.record(
                PoolRecord::new(&event.address, "Connection created")
                    .connection(event.connection_id),
            ),
            CmapEvent::ConnectionReady(event) => self.record(PoolRecord {
                duration_ms: Some(event.duration.as_millis()),
                ..PoolRecord::new(&event.address, "Connection ready").connection(event.connection_id)
            }),
            CmapEvent::ConnectionClosed(event) => self.record(PoolRecord {
                reason: Some(event.reason.tracing_representation()),
                error: event.error.map(|e| e.tracing_representation()),
                ..PoolRecord::new(&event.address, "Connection closed")
                    .connection(event.connection_id)
            }),
            CmapEvent::ConnectionCheckoutStarted(event) => {
                self.record(PoolRecord::new(&event.address, "Connection checkout started"))
            }
            CmapEvent::ConnectionCheckoutFailed(event) => self.record(PoolRecord {
                reason: Some(event.reason.tracing_representation()),
                error: event.error.map(|e| e.tracing_representation()),
                ..PoolRecord::new(&event.address, "Connection checkout failed")
            }),
            CmapEvent::ConnectionCheckedOut(event) => self.record(
                PoolRecord::new(&event.address, "Connection checked out")
                    .connection(event.connection_id),
            ),
            CmapEvent::ConnectionCheckedIn(event) => self.record(
                PoolRecord::new(&event.address, "Connection checked in")
                    .connection(event.connection_id),
            ),
        }
    }

    fn record(&self, record: PoolRecord<'_>) {
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            topologyId = self.topology_id.tracing_representation(),
            serverHost = record.address.host(),
            serverPort = record.address.port_tracing_representation(),
            connectionId = record.connection_id,
            reason = record.reason,
            error = record.error,
            durationMS = record.duration_ms,
            generation = record.generation,
            "{}",
            record.message,
        );
    }
}

impl TracingRepresentation for ConnectionClosedReason {
    type Representation = &'static str;

    fn tracing_representation(&self) -> &'static str {
        match self {
            Self::Stale => "the pool was cleared after the connection was created",
            Self::Idle => "the connection sat unused for longer than the max idle time",
            Self::Error => "the connection saw a network error",
            Self::PoolClosed => "the pool was closed",
        }
    }
}

impl TracingRepresentation for ConnectionCheckoutFailedReason {
    type Representation = &'static str;

    fn tracing_representation(&self) -> &'static str {
        match self {
            Self::Timeout => "no connection became available before the deadline",
            Self::ConnectionError => "establishing a new connection failed",
            Self::PoolCleared => "the pool was paused or cleared",
        }
    }
}
