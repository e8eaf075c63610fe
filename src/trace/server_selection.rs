use std::time::{Duration, Instant};

use super::{
    trace_or_log_enabled,
    TracingOrLogLevel,
    TracingRepresentation,
    SERVER_SELECTION_TRACING_EVENT_TARGET,
};
use crate::{
    bson::oid::ObjectId,
    error::Error,
    sdam::{SelectedServer, TopologyDescription},
    selection_criteria::SelectionCriteria,
};

impl TracingRepresentation for SelectionCriteria {
    type Representation = String;

    fn tracing_representation(&self) -> Self::Representation {
        self.to_string()
    }
}

impl TracingRepresentation for TopologyDescription {
    type Representation = String;

    fn tracing_representation(&self) -> Self::Representation {
        self.to_string()
    }
}

/// Records the progress of one selection attempt, from start to its outcome.
pub(crate) struct ServerSelectionEventEmitter<'a> {
    topology_id: ObjectId,
    criteria: &'a SelectionCriteria,
    start_time: Instant,
    timeout: Duration,
}

impl<'a> ServerSelectionEventEmitter<'a> {
    pub(crate) fn new(
        topology_id: ObjectId,
        criteria: &'a SelectionCriteria,
        start_time: Instant,
        timeout: Duration,
    ) -> Self {
        Self {
            topology_id,
            criteria,
            start_time,
            timeout,
        }
    }

    pub(crate) fn emit_started_event(&self, topology: &TopologyDescription) {
        if trace_or_log_enabled!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            TracingOrLogLevel::Debug
        ) {
            tracing::debug!(
                target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                selector = self.criteria.tracing_representation(),
                topologyDescription = topology.tracing_representation(),
                "Server selection started"
            );
        }
    }

    pub(crate) fn emit_failed_event(&self, topology: &TopologyDescription, error: &Error) {
        if trace_or_log_enabled!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            TracingOrLogLevel::Debug
        ) {
            tracing::debug!(
                target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                selector = self.criteria.tracing_representation(),
                topologyDescription = topology.tracing_representation(),
                failure = error.tracing_representation(),
                durationMS = self.start_time.elapsed().as_millis(),
                "Server selection failed"
            );
        }
    }

    pub(crate) fn emit_succeeded_event(
        &self,
        topology: &TopologyDescription,
        server: &SelectedServer,
    ) {
        if trace_or_log_enabled!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            TracingOrLogLevel::Debug
        ) {
            let address = server.address();
            tracing::debug!(
                target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                selector = self.criteria.tracing_representation(),
                topologyDescription = topology.tracing_representation(),
                serverHost = address.host(),
                serverPort = address.port_tracing_representation(),
                durationMS = self.start_time.elapsed().as_millis(),
                "Server selection succeeded"
            );
        }
    }

    /// Emitted once per selection, the first time no suitable server is found.
    pub(crate) fn emit_waiting_event(&self, topology: &TopologyDescription) {
        if trace_or_log_enabled!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            TracingOrLogLevel::Info
        ) {
            let remaining = self.timeout.saturating_sub(self.start_time.elapsed());
            tracing::info!(
                target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                selector = self.criteria.tracing_representation(),
                topologyDescription = topology.tracing_representation(),
                remainingTimeMS = remaining.as_millis(),
                "Waiting for a suitable server"
            );
        }
    }
}
