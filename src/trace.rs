//! Structured logging. Every record goes through `tracing`; the `log` facade is also consulted
//! when deciding whether a record is worth building, so applications using either see them.

use crate::{
    bson::oid::ObjectId,
    error::Error,
    options::{ServerAddress, DEFAULT_PORT},
};

pub(crate) mod connection;
pub(crate) mod server_selection;
pub(crate) mod topology;

pub(crate) const CONNECTION_TRACING_EVENT_TARGET: &str = "mongodb_sdam::connection";
pub(crate) const SERVER_SELECTION_TRACING_EVENT_TARGET: &str = "mongodb_sdam::server_selection";
pub(crate) const TOPOLOGY_TRACING_EVENT_TARGET: &str = "mongodb_sdam::topology";

/// How a value is rendered as a field of a tracing record.
pub(crate) trait TracingRepresentation {
    type Representation;

    fn tracing_representation(&self) -> Self::Representation;
}

impl TracingRepresentation for ObjectId {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_hex()
    }
}

impl TracingRepresentation for Error {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

impl ServerAddress {
    /// The port to log, with the default filled in when none was given.
    pub(crate) fn port_tracing_representation(&self) -> u16 {
        self.port().unwrap_or(DEFAULT_PORT)
    }
}

/// The record levels this crate emits at.
pub(crate) enum TracingOrLogLevel {
    Debug,
    Info,
}

impl TracingOrLogLevel {
    pub(crate) const fn as_log_level(&self) -> log::Level {
        match self {
            Self::Debug => log::Level::Debug,
            Self::Info => log::Level::Info,
        }
    }

    pub(crate) const fn as_tracing_level(&self) -> tracing::Level {
        match self {
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
        }
    }
}

/// Whether a `tracing` subscriber or a `log` logger would record at this target and level.
/// The level must be a constant.
macro_rules! trace_or_log_enabled {
    (target: $target:expr, $lvl:expr) => {
        tracing::enabled!(target: $target, $lvl.as_tracing_level())
            || log::log_enabled!(target: $target, $lvl.as_log_level())
    };
}
pub(crate) use trace_or_log_enabled;
