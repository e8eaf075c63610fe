use tokio::sync::mpsc;

use super::Connection;
use crate::{
    error::Error,
    runtime::{AcknowledgedMessage, AcknowledgmentReceiver},
};

pub(super) fn channel() -> (PoolManager, ManagementRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        PoolManager { sender },
        ManagementRequestReceiver { receiver },
    )
}

/// Struct used to make management requests to the pool (e.g. checking in a connection).
/// A PoolManager will NOT keep a pool from going out of scope and closing.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    /// Clear the pool, waiting until the worker has bumped the generation and failed every
    /// queued request.
    pub(super) async fn clear(&self, cause: Error) {
        let (message, acknowledgment_receiver) = AcknowledgedMessage::package(());
        if self
            .sender
            .send(PoolManagementRequest::Clear {
                _completion_handler: message,
                cause,
            })
            .is_ok()
        {
            acknowledgment_receiver.wait_for_acknowledgment().await;
        }
    }

    /// Mark the pool as "ready". The returned receiver resolves once the worker has processed the
    /// request.
    pub(super) fn mark_as_ready(&self) -> AcknowledgmentReceiver<()> {
        let (message, listener) = AcknowledgedMessage::package(());
        let _: std::result::Result<_, _> = self.sender.send(PoolManagementRequest::MarkAsReady {
            completion_handler: message,
        });
        listener
    }

    /// Check in the given connection to the pool.
    /// This returns an error containing the connection if the pool has been dropped already.
    pub(crate) fn check_in(&self, connection: Connection) -> std::result::Result<(), Connection> {
        if let Err(request) = self
            .sender
            .send(PoolManagementRequest::CheckIn(Box::new(connection)))
        {
            return match request.0 {
                PoolManagementRequest::CheckIn(connection) => Err(*connection),
                _ => Ok(()),
            };
        }
        Ok(())
    }

    /// Notify the pool that establishing a connection failed.
    pub(super) fn handle_connection_failed(&self) {
        let _: std::result::Result<_, _> = self
            .sender
            .send(PoolManagementRequest::HandleConnectionFailed);
    }

    /// Notify the pool that establishing a connection succeeded, optionally handing it the
    /// resulting connection to keep.
    pub(super) fn handle_connection_succeeded(&self, connection: Option<Connection>) {
        let _: std::result::Result<_, _> = self
            .sender
            .send(PoolManagementRequest::HandleConnectionSucceeded(
                connection.map(Box::new),
            ));
    }
}

#[derive(Debug)]
pub(super) struct ManagementRequestReceiver {
    receiver: mpsc::UnboundedReceiver<PoolManagementRequest>,
}

impl ManagementRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<PoolManagementRequest> {
        self.receiver.recv().await
    }
}

#[derive(Debug)]
pub(super) enum PoolManagementRequest {
    /// Clear the pool, transitioning it to Paused. The message is dropped, and with it the
    /// acknowledgment sent, once the clear has been processed.
    Clear {
        _completion_handler: AcknowledgedMessage<()>,
        cause: Error,
    },

    /// Mark the pool as Ready, allowing connections to be created and checked out.
    MarkAsReady {
        completion_handler: AcknowledgedMessage<()>,
    },

    CheckIn(Box<Connection>),

    HandleConnectionFailed,

    HandleConnectionSucceeded(Option<Box<Connection>>),
}
