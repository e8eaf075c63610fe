use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    watch::{self, Ref},
};

use super::{
    description::topology::TopologyDescriptionDiff,
    Server,
    ServerDescription,
    ServerType,
    TopologyDescription,
    TopologyType,
};
use crate::{
    bson::oid::ObjectId,
    cmap::{establish::ConnectionEstablisher, Connection},
    error::{Error, Result},
    event::sdam::{
        SdamEvent,
        SdamEventEmitter,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    options::{ClusterOptions, ServerAddress},
    runtime::{self, stream::Connector, AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
    trace::TOPOLOGY_TRACING_EVENT_TARGET,
};

/// A strongly-owned handle to the topology. When every handle has been dropped, the topology
/// worker closes the topology and stops monitoring.
#[derive(Debug)]
pub(crate) struct Topology {
    id: ObjectId,
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    _worker_handle: WorkerHandle,
}

impl Topology {
    /// Creates the topology and starts monitoring its seeds. Must be called from within a tokio
    /// runtime.
    pub(crate) fn new(options: ClusterOptions, connector: Arc<dyn Connector>) -> Result<Topology> {
        options.validate()?;

        let id = ObjectId::new();
        let description = TopologyDescription::new(&options);
        let is_load_balanced = description.topology_type() == TopologyType::LoadBalanced;
        let event_emitter = SdamEventEmitter::new(options.sdam_event_handler.clone(), id);
        let connection_establisher = ConnectionEstablisher::new(connector, &options);

        let (updater, update_receiver) = TopologyUpdater::channel();
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();

        let servers: HashMap<_, _> = description
            .server_addresses()
            .map(|address| {
                (
                    address.clone(),
                    Server::new(
                        address.clone(),
                        &options,
                        connection_establisher.clone(),
                        updater.clone(),
                        event_emitter.clone(),
                        id,
                    ),
                )
            })
            .collect();

        event_emitter.emit_event(|| SdamEvent::TopologyOpening(TopologyOpeningEvent { topology_id: id }));
        event_emitter.emit_event(|| {
            SdamEvent::TopologyDescriptionChanged(Box::new(TopologyDescriptionChangedEvent {
                topology_id: id,
                previous_description: TopologyDescription::default(),
                new_description: description.clone(),
            }))
        });
        for address in servers.keys() {
            event_emitter.emit_event(|| {
                SdamEvent::ServerOpening(ServerOpeningEvent {
                    address: address.clone(),
                    topology_id: id,
                })
            });
        }

        for server in servers.values() {
            if is_load_balanced {
                // Load balancers are never checked, so their pools are usable immediately.
                let _ = server.pool.mark_as_ready();
            } else {
                server.monitor.start();
            }
        }

        let state = TopologyState {
            description,
            servers,
        };
        let (watcher, broadcaster) = TopologyWatcher::channel(state);

        TopologyWorker {
            id,
            update_receiver,
            handle_listener,
            broadcaster,
            options,
            connection_establisher,
            topology_updater: updater.clone(),
            event_emitter,
        }
        .start();

        Ok(Topology {
            id,
            watcher,
            updater,
            _worker_handle: worker_handle,
        })
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    /// Returns a watcher that has already observed the latest state.
    pub(crate) fn watch(&self) -> TopologyWatcher {
        let mut watcher = self.watcher.clone();
        watcher.receiver.borrow_and_update();
        watcher
    }

    pub(crate) fn updater(&self) -> &TopologyUpdater {
        &self.updater
    }

    pub(crate) fn description(&self) -> TopologyDescription {
        self.watcher.borrow_latest().description.clone()
    }

    /// Wakes the monitor of every known server.
    pub(crate) fn request_immediate_check(&self) {
        self.watcher.request_immediate_check();
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.updater
            .handle_application_error(address, error, phase)
            .await
    }

    /// Closes the topology, returning once every monitor has been told to stop and every pool
    /// has been released.
    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }

    #[cfg(test)]
    pub(crate) fn servers(&self) -> HashMap<ServerAddress, Arc<Server>> {
        self.watcher.borrow_latest().servers.clone()
    }
}

/// The description of the topology together with the servers it contains. A new state is
/// published on every change; published states are never mutated.
#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

#[derive(Debug)]
pub(crate) enum UpdateMessage {
    ServerUpdate(Box<ServerDescription>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    Shutdown,
}

/// The task that owns the topology state. All updates are applied here, one at a time, in the
/// order they were sent.
struct TopologyWorker {
    id: ObjectId,
    update_receiver: TopologyUpdateReceiver,
    handle_listener: WorkerHandleListener,
    broadcaster: TopologyBroadcaster,
    options: ClusterOptions,
    connection_establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    event_emitter: SdamEventEmitter,
}

impl TopologyWorker {
    fn start(mut self) {
        runtime::execute(async move {
            let mut shutdown_ack = None;

            loop {
                tokio::select! {
                    Some(update) = self.update_receiver.recv() => {
                        let (update, ack) = update.into_parts();
                        let changed = match update {
                            UpdateMessage::ServerUpdate(sd) => self.update_server(*sd).await,
                            UpdateMessage::MonitorError { address, error } => {
                                self.handle_monitor_error(address, error).await
                            }
                            UpdateMessage::ApplicationError {
                                address,
                                error,
                                phase,
                            } => self.handle_application_error(address, error, phase).await,
                            UpdateMessage::Shutdown => {
                                shutdown_ack = Some(ack);
                                break;
                            }
                        };
                        ack.acknowledge(changed);
                    },
                    _ = self.handle_listener.wait_for_all_handle_drops() => break,
                    else => break,
                }
            }

            self.close();
            if let Some(ack) = shutdown_ack {
                ack.acknowledge(true);
            }
        });
    }

    /// Stops every monitor, releases every server and publishes the emptied state.
    fn close(&mut self) {
        let mut state = self.broadcaster.clone_latest();
        for (address, server) in state.servers.drain() {
            server.monitor.stop();
            self.event_emitter.emit_event(|| {
                SdamEvent::ServerClosed(ServerClosedEvent {
                    address,
                    topology_id: self.id,
                })
            });
        }
        self.broadcaster.publish_new_state(state);

        self.event_emitter.emit_event(|| {
            SdamEvent::TopologyClosed(TopologyClosedEvent {
                topology_id: self.id,
            })
        });
    }

    /// Folds a new server description into the topology, publishing the result if anything
    /// changed. Returns whether the topology changed.
    async fn update_server(&mut self, server_description: ServerDescription) -> bool {
        let address = server_description.address.clone();
        let mut latest_state = self.broadcaster.clone_latest();
        let old_description = latest_state.description.clone();

        latest_state.description = match old_description.apply(server_description) {
            Ok(description) => description,
            Err(error) => {
                tracing::warn!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    serverHost = address.host(),
                    serverPort = address.port_tracing_representation(),
                    error = %error,
                    "discarding server description that could not be applied"
                );
                return false;
            }
        };

        self.sync_hosts(&mut latest_state);
        let topology_changed =
            self.process_topology_diff(&old_description, &latest_state.description);

        let server_type = latest_state
            .description
            .get_server_description(&address)
            .map(|sd| sd.server_type)
            .unwrap_or(ServerType::Unknown);
        if server_type.is_data_bearing()
            || (server_type != ServerType::Unknown
                && latest_state.description.topology_type() == TopologyType::Single)
        {
            if let Some(server) = latest_state.servers.get(&address) {
                server.pool.mark_as_ready().wait_for_acknowledgment().await;
            }
        }

        // Round trip times and update times are not part of description equality, so a stored
        // description is published even when no event fires.
        let stored = latest_state.description.get_server_description(&address).is_some();
        if topology_changed || stored {
            self.broadcaster.publish_new_state(latest_state);
        }

        topology_changed
    }

    /// Makes the set of servers match the addresses in the description, starting monitors for
    /// new members and stopping those of removed ones.
    fn sync_hosts(&self, state: &mut TopologyState) {
        let description = &state.description;
        state.servers.retain(|address, server| {
            let keep = description.get_server_description(address).is_some();
            if !keep {
                server.monitor.stop();
            }
            keep
        });

        let is_load_balanced = description.topology_type() == TopologyType::LoadBalanced;
        for address in description.server_addresses() {
            if state.servers.contains_key(address) {
                continue;
            }

            let server = Server::new(
                address.clone(),
                &self.options,
                self.connection_establisher.clone(),
                self.topology_updater.clone(),
                self.event_emitter.clone(),
                self.id,
            );
            if !is_load_balanced {
                server.monitor.start();
            }
            state.servers.insert(address.clone(), server);
        }
    }

    /// Emits the events describing the difference between two descriptions. Returns whether
    /// they differ.
    fn process_topology_diff(
        &self,
        old_description: &TopologyDescription,
        new_description: &TopologyDescription,
    ) -> bool {
        let diff = match old_description.diff(new_description) {
            Some(diff) => diff,
            None => return false,
        };
        let TopologyDescriptionDiff {
            removed_addresses,
            added_addresses,
            changed_servers,
        } = diff;

        for (address, (previous_description, new_description)) in changed_servers {
            self.event_emitter.emit_event(|| {
                SdamEvent::ServerDescriptionChanged(Box::new(ServerDescriptionChangedEvent {
                    address: address.clone(),
                    topology_id: self.id,
                    previous_description: previous_description.clone(),
                    new_description: new_description.clone(),
                }))
            });
        }

        for address in removed_addresses {
            self.event_emitter.emit_event(|| {
                SdamEvent::ServerClosed(ServerClosedEvent {
                    address: address.clone(),
                    topology_id: self.id,
                })
            });
        }

        for address in added_addresses {
            self.event_emitter.emit_event(|| {
                SdamEvent::ServerOpening(ServerOpeningEvent {
                    address: address.clone(),
                    topology_id: self.id,
                })
            });
        }

        self.event_emitter.emit_event(|| {
            SdamEvent::TopologyDescriptionChanged(Box::new(TopologyDescriptionChangedEvent {
                topology_id: self.id,
                previous_description: old_description.clone(),
                new_description: new_description.clone(),
            }))
        });

        true
    }

    async fn mark_server_as_unknown(&mut self, address: ServerAddress, error: Error) -> bool {
        let description = ServerDescription::new_from_error(address, error);
        self.update_server(description).await
    }

    async fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        let server = match self.server(&address) {
            Some(server) => server,
            None => return false,
        };

        let updated = self.mark_server_as_unknown(address, error.clone()).await;
        if updated {
            server.pool.clear(error).await;
        }
        updated
    }

    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let server = match self.server(&address) {
            Some(server) => server,
            None => return false,
        };

        // Errors from connections created before the last clear describe a state that has
        // already been handled.
        if phase.generation() < server.pool.generation() {
            return false;
        }

        let is_load_balanced = self.broadcaster.borrow_latest().description.topology_type()
            == TopologyType::LoadBalanced;

        if error.is_state_change_error() {
            let updated = is_load_balanced
                || self
                    .mark_server_as_unknown(server.address.clone(), error.clone())
                    .await;

            if updated && (error.is_shutting_down() || phase.wire_version().unwrap_or(0) < 8) {
                server.pool.clear(error).await;
            }
            server.monitor.request_immediate_check();

            updated
        } else if error.is_non_timeout_network_error()
            || (phase.is_before_completion()
                && (error.is_auth_error()
                    || error.is_network_timeout()
                    || error.is_command_error()))
        {
            let updated = is_load_balanced
                || self
                    .mark_server_as_unknown(server.address.clone(), error.clone())
                    .await;
            if updated {
                server.pool.clear(error).await;
            }
            updated
        } else {
            false
        }
    }

    fn server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.broadcaster
            .borrow_latest()
            .servers
            .get(address)
            .cloned()
    }
}

/// Handle used to send updates to the topology worker. Updaters do not keep the topology alive.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    sender: UnboundedSender<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdater {
    pub(crate) fn channel() -> (TopologyUpdater, TopologyUpdateReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();

        let updater = TopologyUpdater { sender: tx };

        let update_receiver = TopologyUpdateReceiver {
            update_receiver: rx,
        };

        (updater, update_receiver)
    }

    /// Sends `update` and waits until the worker has processed it. Returns whether the topology
    /// changed; false if the worker has already exited.
    async fn send_message(&self, update: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(update);

        match self.sender.send(message) {
            Ok(_) => receiver.wait_for_acknowledgment().await.unwrap_or(false),
            _ => false,
        }
    }

    pub(crate) async fn update(&self, server_description: ServerDescription) -> bool {
        self.send_message(UpdateMessage::ServerUpdate(Box::new(server_description)))
            .await
    }

    /// Marks the server Unknown because its monitor could not check it, clearing its pool.
    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send_message(UpdateMessage::MonitorError { address, error })
            .await
    }

    /// Applies the consequences of an error encountered while using a connection.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send_message(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
        })
        .await
    }

    pub(crate) async fn shutdown(&self) {
        self.send_message(UpdateMessage::Shutdown).await;
    }
}

pub(crate) struct TopologyUpdateReceiver {
    update_receiver: UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdateReceiver {
    pub(crate) async fn recv(&mut self) -> Option<AcknowledgedMessage<UpdateMessage, bool>> {
        self.update_receiver.recv().await
    }
}

/// Read-only view of the latest published topology state.
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    fn channel(initial_state: TopologyState) -> (TopologyWatcher, TopologyBroadcaster) {
        let (tx, rx) = watch::channel(initial_state);
        let watcher = TopologyWatcher { receiver: rx };
        let broadcaster = TopologyBroadcaster { state_sender: tx };
        (watcher, broadcaster)
    }

    /// Whether the topology worker is still running.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    /// Clones the latest state, marking it as seen.
    pub(crate) fn clone_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    /// Waits for a state newer than the last one seen, up to `timeout`. Returns whether one was
    /// published.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        let changed = runtime::timeout(timeout, self.receiver.changed())
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);
        self.receiver.borrow_and_update();
        changed
    }

    /// Borrows the latest state. The borrow must not be held across an await point.
    pub(crate) fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.receiver.borrow()
    }

    pub(crate) fn request_immediate_check(&self) {
        for server in self.receiver.borrow().servers.values() {
            server.monitor.request_immediate_check();
        }
    }
}

struct TopologyBroadcaster {
    state_sender: watch::Sender<TopologyState>,
}

impl TopologyBroadcaster {
    fn clone_latest(&self) -> TopologyState {
        self.borrow_latest().clone()
    }

    fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.state_sender.borrow()
    }

    fn publish_new_state(&self, state: TopologyState) {
        // `send_replace` stores the state even when no watcher is currently subscribed.
        self.state_sender.send_replace(state);
    }
}

/// Describes a point in time during an operation's execution relative to the handshake of the
/// connection being used.
///
/// This decides how errors raised at that point affect the topology.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// Before the initial `hello` completed, e.g. when opening the stream.
    PreHello { generation: u32 },

    /// After the initial `hello` completed but before authentication finished.
    PostHello { generation: u32 },

    /// After the handshake completed, e.g. when a command was sent.
    AfterCompletion {
        generation: u32,
        max_wire_version: i32,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(handshaked_connection: &Connection) -> Self {
        Self::AfterCompletion {
            generation: handshaked_connection.generation,
            // A handshaked connection always has a stream description.
            max_wire_version: handshaked_connection
                .stream_description()
                .ok()
                .and_then(|sd| sd.max_wire_version)
                .unwrap_or(0),
        }
    }

    /// The pool generation of the connection that hit the error.
    pub(crate) fn generation(&self) -> u32 {
        match self {
            Self::PreHello { generation }
            | Self::PostHello { generation }
            | Self::AfterCompletion { generation, .. } => *generation,
        }
    }

    fn is_before_completion(&self) -> bool {
        !matches!(self, HandshakePhase::AfterCompletion { .. })
    }

    /// The wire version reported by the handshake, if it completed.
    fn wire_version(&self) -> Option<i32> {
        match self {
            HandshakePhase::AfterCompletion {
                max_wire_version, ..
            } => Some(*max_wire_version),
            _ => None,
        }
    }
}
