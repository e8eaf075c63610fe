pub(crate) mod server_selection;
#[cfg(test)]
mod test;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use crate::{
    bson::oid::ObjectId,
    error::{Error, Result},
    options::{ClusterOptions, ServerAddress},
    sdam::{
        description::server::{ServerDescription, ServerType, DEFAULT_MAX_WIRE_VERSION},
        DEFAULT_HEARTBEAT_FREQUENCY,
    },
    trace::TOPOLOGY_TRACING_EVENT_TARGET,
};

pub use self::server_selection::SelectedServer;
pub(crate) use self::server_selection::attempt_to_select_server;

/// The period at which an idle primary writes a no-op; it bounds how stale a secondary can
/// appear while the deployment is idle.
pub(crate) const DEFAULT_IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// The possible types for a topology.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, derive_more::Display)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A load balanced topology.
    LoadBalanced,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

/// A description of the most up-to-date information known about a topology.
///
/// Descriptions are never mutated once published; every update produces a new one.
#[derive(Debug, Clone)]
pub struct TopologyDescription {
    /// Whether or not the topology was initialized with a single seed.
    pub(crate) single_seed: bool,

    /// The current type of the topology.
    pub(crate) topology_type: TopologyType,

    /// The replica set name of the topology.
    pub(crate) set_name: Option<String>,

    /// The highest replica set version seen from any member of the topology.
    pub(crate) max_set_version: Option<i32>,

    /// The highest replica set election id seen from any member of the topology.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Describes the compatibility issue between this crate and a server with regards to the
    /// respective supported wire versions.
    pub(crate) compatibility_error: Option<String>,

    /// The amount of latency beyond that of the suitable server with the minimum latency that is
    /// acceptable for a read operation.
    pub(crate) local_threshold: Option<Duration>,

    /// The maximum amount of time to wait before checking a given server by sending server check.
    pub(crate) heartbeat_freq: Option<Duration>,

    pub(crate) idle_write_period: Option<Duration>,

    /// The newest wire version this crate accepts from servers.
    pub(crate) max_wire_version: i32,

    /// The server descriptions of each member of the topology.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        // Equality decides whether events are emitted, so only fields that the selection algorithm
        // depends on are compared.
        self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
            && self.topology_type == other.topology_type
    }
}

impl Default for TopologyDescription {
    fn default() -> Self {
        Self {
            single_seed: false,
            topology_type: TopologyType::Unknown,
            set_name: None,
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            local_threshold: None,
            heartbeat_freq: None,
            idle_write_period: None,
            max_wire_version: DEFAULT_MAX_WIRE_VERSION,
            servers: HashMap::new(),
        }
    }
}

impl TopologyDescription {
    pub(crate) fn new(options: &ClusterOptions) -> Self {
        let topology_type = if options.load_balanced == Some(true) {
            TopologyType::LoadBalanced
        } else if options.direct_connection == Some(true) {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        let servers: HashMap<_, _> = options
            .hosts
            .iter()
            .map(|address| {
                let description = if topology_type == TopologyType::LoadBalanced {
                    ServerDescription::new_load_balancer(address.clone())
                } else {
                    ServerDescription::new(address.clone())
                };
                (address.clone(), description)
            })
            .collect();

        Self {
            single_seed: servers.len() == 1,
            topology_type,
            set_name: options.repl_set_name.clone(),
            local_threshold: options.local_threshold,
            heartbeat_freq: options.heartbeat_freq,
            idle_write_period: options.idle_write_period,
            max_wire_version: options.max_wire_version.unwrap_or(DEFAULT_MAX_WIRE_VERSION),
            servers,
            ..Default::default()
        }
    }

    /// Gets the topology type of the cluster.
    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    /// The replica set name of the deployment, once known.
    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    /// The descriptions of every member of the topology.
    pub fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    /// The description of the server at `address`, if it is a member of the topology.
    pub fn get_server_description(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    /// The error describing why the deployment cannot be used by this crate, if any.
    pub fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    /// Gets the heartbeat frequency.
    fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    fn idle_write_period(&self) -> Duration {
        self.idle_write_period.unwrap_or(DEFAULT_IDLE_WRITE_PERIOD)
    }

    /// Check the cluster for a compatibility error, and record the error message if one is found.
    fn check_compatibility(&mut self) {
        self.compatibility_error = None;

        for server in self.servers.values().filter(|s| s.is_available()) {
            let error_message = server.compatibility_error_message(self.max_wire_version);

            if error_message.is_some() {
                self.compatibility_error = error_message;
                return;
            }
        }
    }

    /// Returns the diff between this topology description and the provided one, or `None` if
    /// they are equal.
    ///
    /// The returned `TopologyDescriptionDiff` refers to the changes reflected in the provided
    /// description. For example, if the provided description has a server in it that this
    /// description does not, it will be returned in the `added_addresses` field.
    pub(crate) fn diff<'a>(
        &'a self,
        other: &'a TopologyDescription,
    ) -> Option<TopologyDescriptionDiff<'a>> {
        if self == other {
            return None;
        }

        let addresses: HashSet<&ServerAddress> = self.server_addresses().collect();
        let other_addresses: HashSet<&ServerAddress> = other.server_addresses().collect();

        let changed_servers = self
            .servers
            .iter()
            .filter_map(|(address, description)| match other.servers.get(address) {
                Some(other_description) if description != other_description => {
                    Some((address, (description, other_description)))
                }
                _ => None,
            });

        Some(TopologyDescriptionDiff {
            removed_addresses: addresses.difference(&other_addresses).cloned().collect(),
            added_addresses: other_addresses.difference(&addresses).cloned().collect(),
            changed_servers: changed_servers.collect(),
        })
    }

    /// Returns the description that results from folding `server_description` into this one,
    /// leaving `self` untouched.
    pub(crate) fn apply(&self, server_description: ServerDescription) -> Result<Self> {
        let mut description = self.clone();
        description.update(server_description)?;
        Ok(description)
    }

    /// Update the topology based on the new information about the topology contained by the
    /// ServerDescription.
    ///
    /// Reports for addresses that are no longer members of the topology are ignored.
    pub(crate) fn update(&mut self, mut server_description: ServerDescription) -> Result<()> {
        if !self.servers.contains_key(&server_description.address) {
            return Ok(());
        }

        if let TopologyType::LoadBalanced = self.topology_type {
            // Load balancers are never monitored, so there is nothing to fold in.
            return Ok(());
        }

        if let (TopologyType::Single, Some(expected_name)) = (self.topology_type, &self.set_name) {
            if server_description.is_available() {
                let got_name = server_description.set_name();
                if !matches!(
                    got_name.as_ref().map(|opt| opt.as_ref()),
                    Ok(Some(name)) if name == expected_name
                ) {
                    let got_display = match got_name {
                        Ok(Some(s)) => format!("{:?}", s),
                        Ok(None) => "<none>".to_string(),
                        Err(e) => format!("<error: {}>", e),
                    };
                    server_description = ServerDescription::new_from_error(
                        server_description.address,
                        Error::invalid_argument(format!(
                            "replica set name {:?} does not match actual name {}",
                            expected_name, got_display,
                        )),
                    );
                }
            }
        }

        // Replace the old info about the server with the new info.
        self.servers.insert(
            server_description.address.clone(),
            server_description.clone(),
        );

        match self.topology_type {
            TopologyType::Single | TopologyType::LoadBalanced => {}
            TopologyType::Unknown => self.update_unknown_topology(server_description)?,
            TopologyType::Sharded => self.update_sharded_topology(server_description),
            TopologyType::ReplicaSetNoPrimary => {
                self.update_replica_set_no_primary_topology(server_description)?
            }
            TopologyType::ReplicaSetWithPrimary => {
                self.update_replica_set_with_primary_topology(server_description)?;
            }
        }

        self.check_compatibility();

        Ok(())
    }

    /// Update the Unknown topology description based on the server description.
    fn update_unknown_topology(&mut self, server_description: ServerDescription) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::PossiblePrimary => {}
            // A ghost has no set name or member list to learn from, only the topology kind.
            ServerType::RsGhost => self.topology_type = TopologyType::ReplicaSetNoPrimary,
            ServerType::Standalone => {
                self.update_unknown_with_standalone_server(server_description)
            }
            ServerType::Mongos => self.topology_type = TopologyType::Sharded,
            ServerType::RsPrimary => {
                self.update_rs_from_primary_server(server_description)?;
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_without_primary_server(server_description)?;
            }
            ServerType::LoadBalancer => {
                return Err(Error::internal("cannot transition to a load balancer"))
            }
        }

        Ok(())
    }

    /// Update the Sharded topology description based on the server description.
    fn update_sharded_topology(&mut self, server_description: ServerDescription) {
        match server_description.server_type {
            ServerType::Unknown | ServerType::PossiblePrimary | ServerType::Mongos => {}
            _ => {
                self.servers.remove(&server_description.address);
            }
        }
    }

    /// Update the ReplicaSetNoPrimary topology description based on the server description.
    fn update_replica_set_no_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::PossiblePrimary | ServerType::RsGhost => {}
            ServerType::LoadBalancer | ServerType::Standalone | ServerType::Mongos => {
                self.remove_unexpected_server(&server_description);
            }
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description)?,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_without_primary_server(server_description)?;
            }
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on the server description.
    fn update_replica_set_with_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::PossiblePrimary | ServerType::RsGhost => {
                self.record_primary_state();
            }
            ServerType::LoadBalancer | ServerType::Standalone | ServerType::Mongos => {
                self.remove_unexpected_server(&server_description);
                self.record_primary_state();
            }
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description)?,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_with_primary_from_member(server_description)?;
            }
        }

        Ok(())
    }

    /// A standalone or router cannot redefine a replica set; its report is discarded and the
    /// address dropped from the membership. The removal is intended: the address only returns if
    /// a primary lists it again.
    fn remove_unexpected_server(&mut self, server_description: &ServerDescription) {
        tracing::warn!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            serverHost = server_description.address.host(),
            serverPort = server_description.address.port_tracing_representation(),
            serverType = %server_description.server_type,
            topologyType = %self.topology_type,
            "removing server whose type does not belong in a replica set"
        );
        self.servers.remove(&server_description.address);
    }

    /// Update the Unknown topology description based on the Standalone server description.
    fn update_unknown_with_standalone_server(&mut self, server_description: ServerDescription) {
        if self.single_seed {
            self.topology_type = TopologyType::Single;
        } else {
            self.servers.remove(&server_description.address);
        }
    }

    /// Update the ReplicaSetNoPrimary topology description based on the non-primary server
    /// description.
    fn update_rs_without_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            // A member of another set leaves the membership rather than staying as Unknown.
            self.servers.remove(&server_description.address);

            return Ok(());
        }

        self.add_new_servers(server_description.known_hosts()?);

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);

            return Ok(());
        }

        if let Some(primary) = server_description.primary()? {
            match self.servers.get(&primary) {
                None => {
                    self.servers
                        .insert(primary.clone(), ServerDescription::new(primary));
                }
                Some(existing) if existing.server_type == ServerType::Unknown => {
                    self.servers.insert(
                        primary.clone(),
                        ServerDescription::new_possible_primary(primary),
                    );
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on the non-primary server
    /// description.
    fn update_rs_with_primary_from_member(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name != server_description.set_name()? {
            // Intentionally dropped from the membership, as in the no-primary case.
            self.servers.remove(&server_description.address);
            self.record_primary_state();

            return Ok(());
        }

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
        }

        self.record_primary_state();

        Ok(())
    }

    /// Update the replica set topology description based on the RSPrimary server description.
    fn update_rs_from_primary_server(&mut self, server_description: ServerDescription) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            // A primary of another set is dropped from the membership, not kept as Unknown.
            self.servers.remove(&server_description.address);
            self.record_primary_state();

            return Ok(());
        }

        if let Some(server_set_version) = server_description.set_version()? {
            if let Some(server_election_id) = server_description.election_id()? {
                if let (Some(topology_max_set_version), Some(topology_max_election_id)) =
                    (self.max_set_version, self.max_election_id)
                {
                    if topology_max_set_version > server_set_version
                        || (topology_max_set_version == server_set_version
                            && topology_max_election_id > server_election_id)
                    {
                        // A newer primary has already been seen, so this report is stale.
                        self.servers.insert(
                            server_description.address.clone(),
                            ServerDescription::new(server_description.address),
                        );
                        self.record_primary_state();
                        return Ok(());
                    }
                }

                self.max_election_id = Some(server_election_id);
            }
        }

        if let Some(server_set_version) = server_description.set_version()? {
            if self
                .max_set_version
                .map(|topology_max_set_version| server_set_version > topology_max_set_version)
                .unwrap_or(true)
            {
                self.max_set_version = Some(server_set_version);
            }
        }

        let addresses: Vec<_> = self.servers.keys().cloned().collect();

        // If any other servers are RSPrimary, replace them with an unknown server description,
        // which will cause them to be updated by a new hello.
        for address in addresses.iter() {
            if address == &server_description.address {
                continue;
            }

            if let Some(ServerType::RsPrimary) = self.servers.get(address).map(|s| s.server_type) {
                self.servers
                    .insert(address.clone(), ServerDescription::new(address.clone()));
            }
        }

        let known_hosts: HashSet<_> = server_description.known_hosts()?.into_iter().collect();
        self.add_new_servers(known_hosts.iter().cloned());

        for address in addresses {
            if !known_hosts.contains(&address) {
                self.servers.remove(&address);
            }
        }

        self.record_primary_state();

        Ok(())
    }

    /// Inspect the topology for a primary server, and update the topology type to
    /// ReplicaSetNoPrimary if none is found.
    ///
    /// This should only be called on a replica set topology.
    fn record_primary_state(&mut self) {
        self.topology_type = if self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary)
        {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Create a new ServerDescription for each address and add it to the topology.
    fn add_new_servers(&mut self, addresses: impl IntoIterator<Item = ServerAddress>) {
        for address in addresses {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::new(address));
        }
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        write!(f, "{{ Type: {}", self.topology_type)?;

        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {}", set_name)?;
        }

        if let Some(max_set_version) = self.max_set_version {
            write!(f, ", Max Set Version: {}", max_set_version)?;
        }

        if let Some(max_election_id) = self.max_election_id {
            write!(f, ", Max Election ID: {}", max_election_id)?;
        }

        if let Some(ref compatibility_error) = self.compatibility_error {
            write!(f, ", Compatibility Error: {}", compatibility_error)?;
        }

        if !self.servers.is_empty() {
            write!(f, ", Servers: [ ")?;
            let mut iter = self.servers.values();
            if let Some(server) = iter.next() {
                write!(f, "{}", server)?;
            }
            for server in iter {
                write!(f, ", {}", server)?;
            }
            write!(f, " ]")?;
        }

        write!(f, " }}")
    }
}

/// Randomly picks up to `n` distinct elements of `values`.
pub(crate) fn choose_n<T>(values: &[T], n: usize) -> impl Iterator<Item = &T> {
    use rand::{prelude::IndexedRandom, rngs::SmallRng, SeedableRng};
    values.choose_multiple(&mut SmallRng::from_os_rng(), n)
}

/// A struct representing the diff between two `TopologyDescription`s.
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    pub(crate) removed_addresses: HashSet<&'a ServerAddress>,
    pub(crate) added_addresses: HashSet<&'a ServerAddress>,
    pub(crate) changed_servers:
        HashMap<&'a ServerAddress, (&'a ServerDescription, &'a ServerDescription)>,
}

pub(crate) fn verify_max_staleness(
    max_staleness: Duration,
    heartbeat_frequency: Duration,
    idle_write_period: Duration,
) -> Result<()> {
    let smallest_max_staleness = std::cmp::max(
        Duration::from_secs(90),
        heartbeat_frequency
            .checked_add(idle_write_period)
            .unwrap_or(Duration::MAX),
    );

    if max_staleness < smallest_max_staleness {
        return Err(Error::invalid_argument(format!(
            "invalid max_staleness value: must be at least {} seconds",
            smallest_max_staleness.as_secs()
        )));
    }

    Ok(())
}
