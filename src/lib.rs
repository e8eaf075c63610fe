//! Server discovery, monitoring, server selection and connection pooling for MongoDB
//! deployments.
//!
//! This crate keeps a live view of a deployment's topology and uses it to route every request to
//! a suitable, reachable server. It is made of four cooperating parts:
//!
//! - a monitor per server that periodically runs `hello` against it and reports what it saw;
//! - the topology, which folds those reports into a single, consistent
//!   [`TopologyDescription`];
//! - server selection, which maps a [`SelectionCriteria`] onto one of the servers in that
//!   description;
//! - a connection pool per server, which is paused and cleared as the topology changes.
//!
//! The wire protocol itself is not part of this crate: connections are opened through a
//! user-supplied [`Connector`], and commands are exchanged as [`bson::Document`]s over the
//! [`CommandStream`]s it returns.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use mongodb_sdam::{Cluster, Connector, error::Result, options::ClusterOptions};
//! use mongodb_sdam::{ReadPreference, SelectionCriteria};
//!
//! # async fn run(connector: Arc<dyn Connector>) -> Result<()> {
//! let options = ClusterOptions::parse("mongodb://a.example.com,b.example.com/?replicaSet=rs")?;
//! let cluster = Cluster::new(options, connector)?;
//!
//! let criteria = SelectionCriteria::ReadPreference(ReadPreference::Nearest { options: None });
//! let mut connection = cluster.check_out(Some(&criteria), None).await?;
//! let reply = connection
//!     .send_command(mongodb_sdam::bson::doc! { "ping": 1 })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Events
//!
//! Changes to the topology and to the connection pools can be observed by setting
//! [`ClusterOptions::sdam_event_handler`](options::ClusterOptions::sdam_event_handler) and
//! [`ClusterOptions::cmap_event_handler`](options::ClusterOptions::cmap_event_handler). The crate
//! also emits [`tracing`] events under the `mongodb_sdam::topology`,
//! `mongodb_sdam::server_selection` and `mongodb_sdam::connection` targets.

#![warn(missing_docs)]
#![cfg_attr(docsrs, warn(rustdoc::missing_crate_level_docs))]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod options;

pub use ::bson;

mod cluster;
mod cmap;
pub mod error;
pub mod event;
mod hello;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
#[cfg(test)]
mod test;
mod trace;

pub use crate::{
    cluster::Cluster,
    cmap::{Authenticator, Connection, StreamDescription},
    runtime::stream::{CommandStream, Connector},
    sdam::{SelectedServer, ServerDescription, ServerType, TopologyDescription, TopologyType},
    selection_criteria::{
        Predicate,
        ReadPreference,
        ReadPreferenceOptions,
        SelectionCriteria,
        TagSet,
    },
};
