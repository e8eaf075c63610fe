mod description;
mod monitor;
mod server;
mod topology;

pub use self::description::{
    server::{ServerDescription, ServerType},
    topology::{SelectedServer, TopologyDescription, TopologyType},
};

pub(crate) use self::{
    description::topology::attempt_to_select_server,
    monitor::{DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
    server::Server,
    topology::{HandshakePhase, Topology, TopologyUpdater, TopologyWatcher},
};
