//! Contains the events and functionality for monitoring Server Discovery and Monitoring.

use std::time::Duration;

use crate::{
    bson::{oid::ObjectId, Document},
    error::Error,
    options::ServerAddress,
};

pub use crate::sdam::{ServerDescription, TopologyDescription, TopologyType};

/// Published when a server description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The server's previous description.
    pub previous_description: ServerDescription,

    /// The server's new description.
    pub new_description: ServerDescription,
}

impl ServerDescriptionChangedEvent {
    #[cfg(test)]
    pub(crate) fn is_marked_unknown_event(&self) -> bool {
        self.previous_description.server_type.is_available()
            && self.new_description.server_type == crate::sdam::ServerType::Unknown
    }
}

/// Published when a server is added to the topology and its monitoring starts.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server is removed from the topology and its monitoring stops.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The ID of the topology.
    pub topology_id: ObjectId,

    /// The topology's previous description.
    pub previous_description: TopologyDescription,

    /// The topology's new description.
    pub new_description: TopologyDescription,
}

/// Published when a topology is initialized.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology is shut down.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server monitor's `hello` command is started.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server monitor's `hello` command succeeds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The execution time of the check, including connection establishment if one was needed.
    pub duration: Duration,

    /// The reply to the `hello` command.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server monitor's `hello` command fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The execution time of the check.
    pub duration: Duration,

    /// The failure that occurred.
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

#[derive(Clone, Debug)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum SdamEvent {
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    TopologyOpening(TopologyOpeningEvent),
    TopologyClosed(TopologyClosedEvent),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

impl SdamEvent {
    /// Routes this event to the matching method of `handler`.
    pub(crate) fn dispatch(self, handler: &dyn SdamEventHandler) {
        match self {
            Self::ServerDescriptionChanged(e) => handler.handle_server_description_changed_event(*e),
            Self::ServerOpening(e) => handler.handle_server_opening_event(e),
            Self::ServerClosed(e) => handler.handle_server_closed_event(e),
            Self::TopologyDescriptionChanged(e) => {
                handler.handle_topology_description_changed_event(*e)
            }
            Self::TopologyOpening(e) => handler.handle_topology_opening_event(e),
            Self::TopologyClosed(e) => handler.handle_topology_closed_event(e),
            Self::ServerHeartbeatStarted(e) => handler.handle_server_heartbeat_started_event(e),
            Self::ServerHeartbeatSucceeded(e) => handler.handle_server_heartbeat_succeeded_event(e),
            Self::ServerHeartbeatFailed(e) => handler.handle_server_heartbeat_failed_event(e),
        }
    }
}

/// Applications can implement this trait to specify custom logic to run on each SDAM event.
///
/// ```rust
/// # use std::sync::Arc;
/// # use mongodb_sdam::{
/// #     event::sdam::{SdamEventHandler, ServerHeartbeatFailedEvent},
/// #     options::ClusterOptions,
/// # };
/// struct FailedHeartbeatLogger;
///
/// impl SdamEventHandler for FailedHeartbeatLogger {
///     fn handle_server_heartbeat_failed_event(&self, event: ServerHeartbeatFailedEvent) {
///         eprintln!("Failed server heartbeat: {:?}", event);
///     }
/// }
///
/// let options = ClusterOptions::builder()
///     .sdam_event_handler(Arc::new(FailedHeartbeatLogger) as Arc<dyn SdamEventHandler>)
///     .build();
/// ```
pub trait SdamEventHandler: Send + Sync {
    /// Called when a server description changes.
    fn handle_server_description_changed_event(&self, _event: ServerDescriptionChangedEvent) {}

    /// Called when a server is added to the topology.
    fn handle_server_opening_event(&self, _event: ServerOpeningEvent) {}

    /// Called when a server is removed from the topology.
    fn handle_server_closed_event(&self, _event: ServerClosedEvent) {}

    /// Called when the topology description changes.
    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {}

    /// Called when the topology is initialized.
    fn handle_topology_opening_event(&self, _event: TopologyOpeningEvent) {}

    /// Called when the topology is shut down.
    fn handle_topology_closed_event(&self, _event: TopologyClosedEvent) {}

    /// Called when a server heartbeat begins.
    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {}

    /// Called when a server heartbeat succeeds.
    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {}

    /// Called when a server heartbeat fails.
    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {}
}

/// Sends SDAM events to the configured handler and to the tracing emitter.
#[derive(Clone)]
pub(crate) struct SdamEventEmitter {
    handler: Option<std::sync::Arc<dyn SdamEventHandler>>,
    tracing_emitter: crate::trace::topology::TopologyTracingEventEmitter,
}

impl SdamEventEmitter {
    pub(crate) fn new(
        handler: Option<std::sync::Arc<dyn SdamEventHandler>>,
        topology_id: ObjectId,
    ) -> Self {
        Self {
            handler,
            tracing_emitter: crate::trace::topology::TopologyTracingEventEmitter::new(topology_id),
        }
    }

    /// Emits the event built by `generate_event`. The event is only constructed when a handler
    /// is registered or topology tracing is enabled.
    pub(crate) fn emit_event(&self, generate_event: impl FnOnce() -> SdamEvent) {
        let tracing_enabled = crate::trace::trace_or_log_enabled!(
            target: crate::trace::TOPOLOGY_TRACING_EVENT_TARGET,
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
