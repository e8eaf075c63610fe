use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use super::{monitor::Monitor, monitor::MonitorHandle, TopologyUpdater};
use crate::{
    bson::oid::ObjectId,
    cmap::{establish::ConnectionEstablisher, ConnectionPool},
    event::sdam::SdamEventEmitter,
    options::{ClusterOptions, ServerAddress},
};

/// Contains the state for a given server in the topology.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,

    /// The connection pool for the server.
    pub(crate) pool: ConnectionPool,

    /// The monitor that checks this server. It is started by the topology once the server has
    /// been added to the published state.
    pub(crate) monitor: MonitorHandle,

    /// Number of operations currently using this server.
    operation_count: AtomicU32,
}

impl Server {
    pub(crate) fn new(
        address: ServerAddress,
        options: &ClusterOptions,
        connection_establisher: ConnectionEstablisher,
        topology_updater: TopologyUpdater,
        sdam_event_emitter: SdamEventEmitter,
        topology_id: ObjectId,
    ) -> Arc<Server> {
        let monitor = Monitor::new(
            address.clone(),
            options,
            connection_establisher.clone(),
            topology_updater.clone(),
            sdam_event_emitter,
            topology_id,
        );

        Arc::new(Self {
            pool: ConnectionPool::new(
                address.clone(),
                connection_establisher,
                topology_updater,
                topology_id,
                options,
            ),
            monitor,
            address,
            operation_count: AtomicU32::new(0),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_mocked(address: ServerAddress, operation_count: u32) -> Self {
        let options = ClusterOptions::default();
        let topology_id = ObjectId::new();
        let (topology_updater, _) = TopologyUpdater::channel();
        let connection_establisher =
            ConnectionEstablisher::new(Arc::new(crate::test::MockConnector::new()), &options);

        Self {
            pool: ConnectionPool::new_mocked(address.clone()),
            monitor: Monitor::new(
                address.clone(),
                &options,
                connection_establisher,
                topology_updater,
                SdamEventEmitter::new(None, topology_id),
                topology_id,
            ),
            address,
            operation_count: AtomicU32::new(operation_count),
        }
    }

    pub(crate) fn increment_operation_count(&self) {
        self.operation_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_operation_count(&self) {
        self.operation_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn operation_count(&self) -> u32 {
        self.operation_count.load(Ordering::SeqCst)
    }
}
