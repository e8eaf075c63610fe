
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    cmap::Connection,
    error::{Error, ErrorKind, Result},
    options::{ClusterOptions, ServerAddress},
    runtime::stream::Connector,
    sdam::{attempt_to_select_server, HandshakePhase, SelectedServer, Topology, TopologyDescription},
    selection_criteria::{ReadPreference, SelectionCriteria},
    trace::server_selection::ServerSelectionEventEmitter,
};

pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// The entry point to a deployment. A `Cluster` monitors every server it discovers, keeps a
/// connection pool per server, and routes each request to a server matching the caller's
/// [`SelectionCriteria`].
///
/// `Cluster` uses [`std::sync::Arc`] internally, so it can safely be shared across threads or
/// async tasks. Monitoring stops once every clone has been dropped or [`Cluster::shutdown`] has
/// been called.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use mongodb_sdam::{Cluster, Connector, error::Result, options::ClusterOptions};
/// # async fn run(connector: Arc<dyn Connector>) -> Result<()> {
/// let options = ClusterOptions::parse("mongodb://a.example.com,b.example.com/?replicaSet=rs")?;
/// let cluster = Cluster::new(options, connector)?;
///
/// let mut connection = cluster.check_out(None, None).await?;
/// connection.send_command(mongodb_sdam::bson::doc! { "ping": 1 }).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

#[derive(Debug)]
struct ClusterInner {
    topology: Topology,
    options: ClusterOptions,
}

impl Cluster {
    /// Creates a new `Cluster` and starts monitoring its seeds. Connections to servers are opened
    /// through `connector`.
    ///
    /// This must be called from within a tokio runtime.
    pub fn new(options: ClusterOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        let topology = Topology::new(options.clone(), connector)?;

        Ok(Self {
            inner: Arc::new(ClusterInner { topology, options }),
        })
    }

    /// Gets the options used to create this cluster.
    pub fn options(&self) -> &ClusterOptions {
        &self.inner.options
    }

    /// Selects a server matching `criteria`, waiting for the topology to change while none does.
    ///
    /// If no criteria are given, the primary is selected. Selection gives up at `deadline`, or
    /// after the configured server selection timeout when no deadline is given, returning a
    /// server selection error that carries the last observed topology.
    pub async fn select_server(
        &self,
        criteria: Option<&SelectionCriteria>,
        deadline: Option<Instant>,
    ) -> Result<SelectedServer> {
        let default_criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let criteria = criteria.unwrap_or(&default_criteria);

        let start_time = Instant::now();
        let timeout = self
            .effective_deadline(start_time, deadline)
            .saturating_duration_since(start_time);

        let event_emitter = ServerSelectionEventEmitter::new(
            self.inner.topology.id(),
            criteria,
            start_time,
            timeout,
        );
        event_emitter.emit_started_event(&self.inner.topology.description());
        // Only emit the waiting message once per selection.
        let mut emitted_waiting_message = false;

        let mut watcher = self.inner.topology.watch();
        loop {
            if !watcher.is_alive() {
                return Err(ErrorKind::Shutdown.into());
            }

            let state = watcher.clone_latest();
            let result = attempt_to_select_server(criteria, &state.description, &state.servers);
            match result {
                Err(error) => {
                    event_emitter.emit_failed_event(&state.description, &error);
                    return Err(error);
                }
                Ok(Some(server)) => {
                    event_emitter.emit_succeeded_event(&state.description, &server);
                    return Ok(server);
                }
                Ok(None) => {
                    if !emitted_waiting_message {
                        event_emitter.emit_waiting_event(&state.description);
                        emitted_waiting_message = true;
                    }

                    watcher.request_immediate_check();

                    let elapsed = start_time.elapsed();
                    let change_occurred = elapsed < timeout
                        && watcher
                            .wait_for_update(timeout.saturating_sub(elapsed))
                            .await;
                    if change_occurred {
                        continue;
                    }
                    if !watcher.is_alive() {
                        return Err(ErrorKind::Shutdown.into());
                    }

                    let error: Error = ErrorKind::ServerSelection {
                        message: state
                            .description
                            .server_selection_timeout_error_message(criteria),
                        topology: Box::new(state.description.clone()),
                    }
                    .into();
                    event_emitter.emit_failed_event(&state.description, &error);
                    return Err(error);
                }
            }
        }
    }

    /// Selects a server matching `criteria` and checks a connection out of its pool. Selection
    /// and checkout share the same deadline.
    ///
    /// Dropping the returned connection checks it back into its pool.
    pub async fn check_out(
        &self,
        criteria: Option<&SelectionCriteria>,
        deadline: Option<Instant>,
    ) -> Result<Connection> {
        let deadline = self.effective_deadline(Instant::now(), deadline);
        let selected = self.select_server(criteria, Some(deadline)).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        selected.server().pool.check_out(Some(remaining)).await
    }

    fn effective_deadline(&self, start: Instant, deadline: Option<Instant>) -> Instant {
        deadline.unwrap_or_else(|| {
            start
                + self
                    .inner
                    .options
                    .server_selection_timeout
                    .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT)
        })
    }

    /// Marks the server at `address` Unknown because of `error`, clearing its pool and requesting
    /// an immediate re-check. Addresses not part of the topology are ignored.
    pub async fn mark_server_unknown(&self, address: &ServerAddress, error: Error) {
        self.inner
            .topology
            .updater()
            .handle_monitor_error(address.clone(), error)
            .await;

        if let Some(server) = self.inner.topology.watch().borrow_latest().servers.get(address) {
            server.monitor.request_immediate_check();
        }
    }

    /// Reports an error encountered while using `connection`. Depending on the error this marks
    /// the server Unknown, clears its pool, or requests an immediate check. Errors from
    /// connections created before the pool was last cleared are ignored.
    pub async fn handle_connection_error(&self, connection: &Connection, error: Error) {
        self.inner
            .topology
            .handle_application_error(
                connection.address().clone(),
                error,
                HandshakePhase::after_completion(connection),
            )
            .await;
    }

    /// A snapshot of the current topology.
    pub fn current_topology(&self) -> TopologyDescription {
        self.inner.topology.description()
    }

    /// Wakes every monitor so that each server is checked as soon as possible.
    pub fn request_immediate_check(&self) {
        self.inner.topology.request_immediate_check();
    }

    /// Stops monitoring, closes every pool and closes the topology. Connections still checked out
    /// are closed when they are dropped. Selection on a shut down cluster fails.
    pub async fn shutdown(&self) {
        self.inner.topology.shutdown().await;
    }

    #[cfg(test)]
    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }
}
