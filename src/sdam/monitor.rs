
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{topology::TopologyUpdater, ServerDescription};
use crate::{
    bson::oid::ObjectId,
    cmap::{establish::ConnectionEstablisher, Connection},
    error::Result,
    event::sdam::{
        SdamEvent,
        SdamEventEmitter,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, run_hello, HelloReply},
    options::{ClusterOptions, ServerAddress},
    runtime,
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// Monitor that performs regular heartbeats to determine server status.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    connection_establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    sdam_event_emitter: SdamEventEmitter,
    topology_id: ObjectId,
    heartbeat_frequency: Duration,
    min_heartbeat_frequency: Duration,
    rtt_info: RttInfo,
    check_request_receiver: CheckRequestReceiver,
    cancellation_token: CancellationToken,
}

impl Monitor {
    /// Creates the monitor for `address` along with the handle used to control it. The monitor
    /// does not run until [`MonitorHandle::start`] is called.
    pub(crate) fn new(
        address: ServerAddress,
        options: &ClusterOptions,
        connection_establisher: ConnectionEstablisher,
        topology_updater: TopologyUpdater,
        sdam_event_emitter: SdamEventEmitter,
        topology_id: ObjectId,
    ) -> MonitorHandle {
        let (check_requester, check_request_receiver) = CheckRequestReceiver::channel();
        let cancellation_token = CancellationToken::new();

        let monitor = Self {
            address,
            connection: None,
            connection_establisher,
            topology_updater,
            sdam_event_emitter,
            topology_id,
            heartbeat_frequency: options.heartbeat_frequency(),
            min_heartbeat_frequency: options.min_heartbeat_frequency(),
            rtt_info: RttInfo::default(),
            check_request_receiver,
            cancellation_token: cancellation_token.clone(),
        };

        MonitorHandle {
            monitor: Arc::new(Mutex::new(Some(monitor))),
            check_requester,
            cancellation_token,
        }
    }

    async fn execute(mut self) {
        while !self.cancellation_token.is_cancelled() {
            self.check_server().await;

            // Never check the same server more than once per minimum heartbeat, even when checks
            // are requested. Requests made in the meantime stay buffered in the channel.
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = runtime::delay_for(self.min_heartbeat_frequency) => {}
            }

            let remaining = self
                .heartbeat_frequency
                .saturating_sub(self.min_heartbeat_frequency);
            let alive = tokio::select! {
                _ = self.cancellation_token.cancelled() => false,
                alive = self.check_request_receiver.wait_for_check_request(remaining) => alive,
            };
            if !alive {
                break;
            }
        }

        tracing::trace!(
            target: crate::trace::TOPOLOGY_TRACING_EVENT_TARGET,
            serverHost = self.address.host(),
            serverPort = self.address.port_tracing_representation(),
            "monitor stopped"
        );
    }

    /// Checks the server once and reports the outcome to the topology. A failed check clears the
    /// server's pool before this returns.
    async fn check_server(&mut self) {
        self.emit_event(|| {
            SdamEvent::ServerHeartbeatStarted(ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
                topology_id: self.topology_id,
            })
        });

        let start = Instant::now();
        let establisher = self.connection_establisher.clone();
        let result = establisher.with_connect_timeout(self.perform_hello()).await;
        let duration = start.elapsed();

        match result {
            Ok(reply) => {
                self.rtt_info.add_sample(duration);
                self.emit_event(|| {
                    SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                        duration,
                        reply: reply.raw_command_response.clone(),
                        server_address: self.address.clone(),
                        topology_id: self.topology_id,
                    })
                });

                let average_rtt = self.rtt_info.average().unwrap_or(duration);
                let description =
                    ServerDescription::new_from_hello_reply(self.address.clone(), reply, average_rtt);
                self.topology_updater.update(description).await;
            }
            Err(error) => {
                self.emit_event(|| {
                    SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                        duration,
                        failure: error.clone(),
                        server_address: self.address.clone(),
                        topology_id: self.topology_id,
                    })
                });

                self.connection = None;
                self.rtt_info.reset();
                self.topology_updater
                    .handle_monitor_error(self.address.clone(), error)
                    .await;
            }
        }
    }

    /// Sends `hello` over the monitoring connection, opening one first if needed.
    async fn perform_hello(&mut self) -> Result<HelloReply> {
        match self.connection {
            Some(ref mut connection) => run_hello(connection, hello_command(None)).await,
            None => {
                let (connection, reply) = self
                    .connection_establisher
                    .establish_monitoring_connection(&self.address)
                    .await?;
                self.connection = Some(connection);
                Ok(reply)
            }
        }
    }

    fn emit_event(&self, generate_event: impl FnOnce() -> SdamEvent) {
        self.sdam_event_emitter.emit_event(generate_event);
    }
}

/// Handle used to start, stop and wake a server's monitor. Clones refer to the same monitor.
#[derive(Clone)]
pub(crate) struct MonitorHandle {
    monitor: Arc<Mutex<Option<Monitor>>>,
    check_requester: broadcast::Sender<()>,
    cancellation_token: CancellationToken,
}

impl std::fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("stopped", &self.cancellation_token.is_cancelled())
            .finish()
    }
}

impl MonitorHandle {
    /// Spawns the monitoring task. Only the first call has an effect.
    pub(crate) fn start(&self) {
        let monitor = match self.monitor.lock() {
            Ok(mut monitor) => monitor.take(),
            Err(_) => None,
        };
        if let Some(monitor) = monitor {
            runtime::execute(monitor.execute());
        }
    }

    /// Stops the monitoring task, dropping its connection. Stopping twice is a no-op.
    pub(crate) fn stop(&self) {
        self.cancellation_token.cancel();
    }

    /// Wakes the monitor so that it checks its server as soon as the minimum heartbeat allows.
    pub(crate) fn request_immediate_check(&self) {
        // An error means the monitor is gone, in which case there is nothing to wake.
        let _: std::result::Result<_, _> = self.check_requester.send(());
    }

    #[cfg(test)]
    pub(crate) fn is_stopped(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

struct CheckRequestReceiver {
    receiver: broadcast::Receiver<()>,
}

impl CheckRequestReceiver {
    fn channel() -> (broadcast::Sender<()>, CheckRequestReceiver) {
        // A single buffered slot is enough: any number of pending requests collapse into one check.
        let (sender, receiver) = broadcast::channel(1);
        (sender, CheckRequestReceiver { receiver })
    }

    /// Waits until a check is requested or `timeout` elapses. Returns false once every handle
    /// has been dropped.
    async fn wait_for_check_request(&mut self, timeout: Duration) -> bool {
        if let Ok(Err(broadcast::error::RecvError::Closed)) =
            runtime::timeout(timeout, self.receiver.recv()).await
        {
            return false;
        }

        // A burst of requests leaves a lag marker and the retained request behind; the coming
        // check answers all of them.
        loop {
            match self.receiver.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return true,
                Err(broadcast::error::TryRecvError::Closed) => return false,
            }
        }
    }
}

/// Exponentially weighted moving average of a server's round trip times.
#[derive(Debug, Default, Clone)]
pub(crate) struct RttInfo {
    average: Option<Duration>,
}

impl RttInfo {
    pub(crate) fn average(&self) -> Option<Duration> {
        self.average
    }

    pub(crate) fn add_sample(&mut self, sample: Duration) {
        self.average = Some(match self.average {
            Some(old_rtt) => sample / 5 + old_rtt * 4 / 5,
            None => sample,
        });
    }

    pub(crate) fn reset(&mut self) {
        self.average = None;
    }
}
