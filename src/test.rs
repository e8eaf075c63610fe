//! Shared test utilities: an in-memory transport whose servers can be reconfigured while a
//! cluster runs, and an event handler that records everything it sees.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::future::BoxFuture;

use crate::{
    bson::{doc, oid::ObjectId, Bson, Document},
    error::{Error, Result},
    event::{cmap::*, sdam::*},
    options::ServerAddress,
    runtime::{
        self,
        stream::{CommandStream, Connector},
    },
};

pub(crate) const MAX_WIRE_VERSION: i32 = 21;

/// How a mock server answers connection attempts and commands.
#[derive(Clone, Debug)]
pub(crate) enum MockServer {
    /// Accept connections and answer `hello` with the given reply. Other commands get `ok: 1`.
    Reply(Document),

    /// Like `Reply`, but `hello` is only answered after the given latency.
    Slow(Document, Duration),

    /// Refuse connections and fail every command sent on existing ones.
    Fail,

    /// Accept connections but never answer any command.
    Hang,
}

/// A [`Connector`] backed by an in-memory table of servers.
#[derive(Clone, Debug, Default)]
pub(crate) struct MockConnector {
    servers: Arc<Mutex<HashMap<ServerAddress, MockServer>>>,
    connections_opened: Arc<Mutex<HashMap<ServerAddress, usize>>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Changes how `address` behaves. Existing streams pick up the change on their next command.
    pub(crate) fn set(&self, address: &ServerAddress, server: MockServer) {
        self.servers.lock().unwrap().insert(address.clone(), server);
    }

    pub(crate) fn with(self, address: &ServerAddress, server: MockServer) -> Self {
        self.set(address, server);
        self
    }

    /// The number of streams successfully opened to `address` so far.
    pub(crate) fn connections_opened(&self, address: &ServerAddress) -> usize {
        self.connections_opened
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    fn server(&self, address: &ServerAddress) -> MockServer {
        self.servers
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or(MockServer::Fail)
    }
}

impl Connector for MockConnector {
    fn connect<'a>(
        &'a self,
        address: &'a ServerAddress,
    ) -> BoxFuture<'a, Result<Box<dyn CommandStream>>> {
        Box::pin(async move {
            if let MockServer::Fail = self.server(address) {
                return Err(std::io::ErrorKind::ConnectionRefused.into());
            }

            *self
                .connections_opened
                .lock()
                .unwrap()
                .entry(address.clone())
                .or_default() += 1;

            let stream: Box<dyn CommandStream> = Box::new(MockStream {
                address: address.clone(),
                connector: self.clone(),
            });
            Ok(stream)
        })
    }
}

struct MockStream {
    address: ServerAddress,
    connector: MockConnector,
}

impl CommandStream for MockStream {
    fn send_command<'a>(&'a mut self, command: Document) -> BoxFuture<'a, Result<Document>> {
        Box::pin(async move {
            match self.connector.server(&self.address) {
                MockServer::Reply(reply) if command.contains_key("hello") => Ok(reply),
                MockServer::Slow(reply, latency) if command.contains_key("hello") => {
                    runtime::delay_for(latency).await;
                    Ok(reply)
                }
                MockServer::Reply(_) | MockServer::Slow(..) => Ok(doc! { "ok": 1 }),
                MockServer::Fail => Err(std::io::ErrorKind::ConnectionReset.into()),
                MockServer::Hang => {
                    std::future::pending::<()>().await;
                    Err(Error::internal("hung stream answered"))
                }
            }
        })
    }
}

fn base_reply() -> Document {
    doc! {
        "ok": 1,
        "helloOk": true,
        "minWireVersion": 0,
        "maxWireVersion": MAX_WIRE_VERSION,
    }
}

fn hosts(members: &[&ServerAddress]) -> Bson {
    Bson::Array(members.iter().map(|m| Bson::String(m.to_string())).collect())
}

pub(crate) fn standalone_reply() -> Document {
    let mut reply = base_reply();
    reply.insert("isWritablePrimary", true);
    reply
}

pub(crate) fn mongos_reply() -> Document {
    let mut reply = base_reply();
    reply.insert("isWritablePrimary", true);
    reply.insert("msg", "isdbgrid");
    reply
}

pub(crate) fn load_balancer_reply() -> Document {
    let mut reply = mongos_reply();
    reply.insert("serviceId", ObjectId::new());
    reply
}

/// A replica set primary listing `members`, with the given election.
pub(crate) fn primary_reply(
    set_name: &str,
    me: &ServerAddress,
    members: &[&ServerAddress],
    set_version: i32,
    election_id: ObjectId,
) -> Document {
    let mut reply = base_reply();
    reply.insert("isWritablePrimary", true);
    reply.insert("setName", set_name);
    reply.insert("me", me.to_string());
    reply.insert("hosts", hosts(members));
    reply.insert("setVersion", set_version);
    reply.insert("electionId", election_id);
    reply
}

pub(crate) fn secondary_reply(
    set_name: &str,
    me: &ServerAddress,
    members: &[&ServerAddress],
    primary: Option<&ServerAddress>,
) -> Document {
    let mut reply = base_reply();
    reply.insert("isWritablePrimary", false);
    reply.insert("secondary", true);
    reply.insert("setName", set_name);
    reply.insert("me", me.to_string());
    reply.insert("hosts", hosts(members));
    if let Some(primary) = primary {
        reply.insert("primary", primary.to_string());
    }
    reply
}

/// Either kind of recorded event.
#[derive(Clone, Debug)]
pub(crate) enum Event {
    Sdam(SdamEvent),
    Cmap(CmapEvent),
}

/// Records every SDAM and CMAP event it receives in a single log, in arrival order.
#[derive(Clone, Debug, Default)]
pub(crate) struct EventBuffer {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventBuffer {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    fn push_sdam(&self, event: SdamEvent) {
        self.events.lock().unwrap().push(Event::Sdam(event));
    }

    fn push_cmap(&self, event: CmapEvent) {
        self.events.lock().unwrap().push(Event::Cmap(event));
    }

    /// Every event recorded so far.
    pub(crate) fn all(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count_sdam(&self, filter: impl Fn(&SdamEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::Sdam(e) if filter(e)))
            .count()
    }

    pub(crate) fn count_cmap(&self, filter: impl Fn(&CmapEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::Cmap(e) if filter(e)))
            .count()
    }

    /// Polls until an SDAM event matching `filter` has been recorded or `timeout` elapses.
    pub(crate) async fn wait_for_sdam(
        &self,
        timeout: Duration,
        filter: impl Fn(&SdamEvent) -> bool,
    ) -> bool {
        wait_until(timeout, || self.count_sdam(&filter) > 0).await
    }

    /// Polls until a CMAP event matching `filter` has been recorded or `timeout` elapses.
    pub(crate) async fn wait_for_cmap(
        &self,
        timeout: Duration,
        filter: impl Fn(&CmapEvent) -> bool,
    ) -> bool {
        wait_until(timeout, || self.count_cmap(&filter) > 0).await
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses. Returns whether it held.
pub(crate) async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    runtime::timeout(timeout, async {
        while !condition() {
            runtime::delay_for(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

impl SdamEventHandler for EventBuffer {
    fn handle_server_description_changed_event(&self, event: ServerDescriptionChangedEvent) {
        self.push_sdam(SdamEvent::ServerDescriptionChanged(Box::new(event)));
    }

    fn handle_server_opening_event(&self, event: ServerOpeningEvent) {
        self.push_sdam(SdamEvent::ServerOpening(event));
    }

    fn handle_server_closed_event(&self, event: ServerClosedEvent) {
        self.push_sdam(SdamEvent::ServerClosed(event));
    }

    fn handle_topology_description_changed_event(&self, event: TopologyDescriptionChangedEvent) {
        self.push_sdam(SdamEvent::TopologyDescriptionChanged(Box::new(event)));
    }

    fn handle_topology_opening_event(&self, event: TopologyOpeningEvent) {
        self.push_sdam(SdamEvent::TopologyOpening(event));
    }

    fn handle_topology_closed_event(&self, event: TopologyClosedEvent) {
        self.push_sdam(SdamEvent::TopologyClosed(event));
    }

    fn handle_server_heartbeat_started_event(&self, event: ServerHeartbeatStartedEvent) {
        self.push_sdam(SdamEvent::ServerHeartbeatStarted(event));
    }

    fn handle_server_heartbeat_succeeded_event(&self, event: ServerHeartbeatSucceededEvent) {
        self.push_sdam(SdamEvent::ServerHeartbeatSucceeded(event));
    }

    fn handle_server_heartbeat_failed_event(&self, event: ServerHeartbeatFailedEvent) {
        self.push_sdam(SdamEvent::ServerHeartbeatFailed(event));
    }
}

impl CmapEventHandler for EventBuffer {
    fn handle_pool_created_event(&self, event: PoolCreatedEvent) {
        self.push_cmap(CmapEvent::PoolCreated(event));
    }

    fn handle_pool_ready_event(&self, event: PoolReadyEvent) {
        self.push_cmap(CmapEvent::PoolReady(event));
    }

    fn handle_pool_cleared_event(&self, event: PoolClearedEvent) {
        self.push_cmap(CmapEvent::PoolCleared(event));
    }

    fn handle_pool_closed_event(&self, event: PoolClosedEvent) {
        self.push_cmap(CmapEvent::PoolClosed(event));
    }

    fn handle_connection_created_event(&self, event: ConnectionCreatedEvent) {
        self.push_cmap(CmapEvent::ConnectionCreated(event));
    }

    fn handle_connection_ready_event(&self, event: ConnectionReadyEvent) {
        self.push_cmap(CmapEvent::ConnectionReady(event));
    }

    fn handle_connection_closed_event(&self, event: ConnectionClosedEvent) {
        self.push_cmap(CmapEvent::ConnectionClosed(event));
    }

    fn handle_connection_checkout_started_event(&self, event: ConnectionCheckoutStartedEvent) {
        self.push_cmap(CmapEvent::ConnectionCheckoutStarted(event));
    }

    fn handle_connection_checkout_failed_event(&self, event: ConnectionCheckoutFailedEvent) {
        self.push_cmap(CmapEvent::ConnectionCheckoutFailed(event));
    }

    fn handle_connection_checked_out_event(&self, event: ConnectionCheckedOutEvent) {
        self.push_cmap(CmapEvent::ConnectionCheckedOut(event));
    }

    fn handle_connection_checked_in_event(&self, event: ConnectionCheckedInEvent) {
        self.push_cmap(CmapEvent::ConnectionCheckedIn(event));
    }
}
