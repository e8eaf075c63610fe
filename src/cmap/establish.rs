use std::{future::Future, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;

use super::{conn::PendingConnection, Connection, StreamDescription};
use crate::{
    error::{Error, ErrorKind, Result},
    hello::{hello_command, run_hello, HelloReply},
    options::{ClusterOptions, ServerAddress},
    runtime::{self, stream::Connector},
    sdam::HandshakePhase,
};

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Authentication run on every new pooled connection once its `hello` handshake has completed.
///
/// Monitoring connections are never authenticated.
pub trait Authenticator: Send + Sync + 'static {
    /// Authenticates `connection`. An error fails the connection's establishment and is treated
    /// like any other handshake failure of the server.
    fn authenticate<'a>(
        &'a self,
        connection: &'a mut Connection,
        stream_description: &'a StreamDescription,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Contains the logic to establish a connection, including handshaking and authenticating.
#[derive(Clone)]
pub(crate) struct ConnectionEstablisher {
    connector: Arc<dyn Connector>,

    authenticator: Option<Arc<dyn Authenticator>>,

    /// `None` when the configured timeout was zero, meaning no timeout.
    connect_timeout: Option<Duration>,

    load_balanced: bool,
}

impl ConnectionEstablisher {
    pub(crate) fn new(connector: Arc<dyn Connector>, options: &ClusterOptions) -> Self {
        let connect_timeout = match options.connect_timeout {
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => Some(DEFAULT_CONNECT_TIMEOUT),
        };

        Self {
            connector,
            authenticator: options.authenticator.clone(),
            connect_timeout,
            load_balanced: options.load_balanced.unwrap_or(false),
        }
    }

    /// Runs `future`, failing with a network timeout if it outlasts the connect timeout.
    pub(crate) async fn with_connect_timeout<T>(
        &self,
        future: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match self.connect_timeout {
            Some(timeout) => runtime::timeout(timeout, future).await?,
            None => future.await,
        }
    }

    /// Establishes a pooled connection: opens a stream, performs the `hello` handshake and
    /// authenticates if an authenticator is configured.
    pub(crate) async fn establish_connection(
        &self,
        pending_connection: PendingConnection,
    ) -> std::result::Result<Connection, EstablishError> {
        let generation = pending_connection.generation;
        let address = pending_connection.address.clone();

        let stream = self
            .with_connect_timeout(self.connector.connect(&address))
            .await
            .map_err(|e| EstablishError::pre_hello(e, generation))?;
        let mut connection = Connection::new(pending_connection, stream);

        let hello_reply = self
            .with_connect_timeout(run_hello(
                &mut connection,
                hello_command(Some(self.load_balanced)),
            ))
            .await
            .map_err(|e| EstablishError::pre_hello(e, generation))?;

        let stream_description = StreamDescription::from_hello_reply(&hello_reply);
        if self.load_balanced && stream_description.service_id.is_none() {
            return Err(EstablishError::post_hello(
                ErrorKind::IncompatibleServer {
                    message: "attempted to connect in load balancing mode, but the server does \
                              not support this mode"
                        .to_string(),
                }
                .into(),
                generation,
            ));
        }
        connection.stream_description = Some(stream_description.clone());

        if let Some(ref authenticator) = self.authenticator {
            authenticator
                .authenticate(&mut connection, &stream_description)
                .await
                .map_err(|e| EstablishError::post_hello(e, generation))?;
        }

        Ok(connection)
    }

    /// Establishes a monitoring connection, returning it along with the reply to its initial
    /// `hello`.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: &ServerAddress,
    ) -> Result<(Connection, HelloReply)> {
        let stream = self.connector.connect(address).await?;
        let mut connection = Connection::new_monitoring(address.clone(), stream);

        let hello_reply = run_hello(&mut connection, hello_command(None)).await?;
        connection.stream_description = Some(StreamDescription::from_hello_reply(&hello_reply));

        Ok((connection, hello_reply))
    }
}

/// An error that occurred while establishing a pooled connection, along with how far the
/// handshake got.
#[derive(Debug, Clone)]
pub(crate) struct EstablishError {
    pub(crate) cause: Error,
    pub(crate) handshake_phase: HandshakePhase,
}

impl EstablishError {
    fn pre_hello(cause: Error, generation: u32) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PreHello { generation },
        }
    }

    fn post_hello(cause: Error, generation: u32) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PostHello { generation },
        }
    }
}
