use std::{fmt, time::Duration};

use crate::{
    bson::{oid::ObjectId, DateTime},
    error::{Error, Result},
    hello::HelloReply,
    options::ServerAddress,
    selection_criteria::TagSet,
};

const DRIVER_MIN_DB_VERSION: &str = "3.6";
pub(crate) const DRIVER_MIN_WIRE_VERSION: i32 = 6;
pub(crate) const DEFAULT_MAX_WIRE_VERSION: i32 = 25;

/// Enum representing the possible types of servers this crate can connect to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, derive_more::Display)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[display("RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[display("RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[display("RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[display("RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the replica
    /// set config.
    #[display("RSGhost")]
    RsGhost,

    /// A load-balancing proxy between this crate and the MongoDB deployment.
    LoadBalancer,

    /// A server that another member reported as its primary but that has not been checked yet.
    PossiblePrimary,

    /// A server that has not been checked yet, or whose last check failed.
    #[default]
    Unknown,
}

impl ServerType {
    /// Whether this server holds data that operations can read or write.
    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    /// Whether the server has been successfully checked. Servers that are unreachable or only
    /// rumored to be primary are not available.
    pub fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown | ServerType::PossiblePrimary)
    }
}

/// An immutable snapshot of the most recent information known about a server.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    pub(crate) address: ServerAddress,
    pub(crate) server_type: ServerType,
    pub(crate) last_update_time: Option<DateTime>,
    pub(crate) average_round_trip_time: Option<Duration>,

    // A freshly added server has neither a reply nor an error until its first check completes,
    // and a failed check carries no reply. Storing a `Result<Option<_>>` keeps "reply and error"
    // unrepresentable while the accessors below can still propagate with `?`.
    pub(crate) reply: std::result::Result<Option<HelloReply>, Error>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(self_reply), Ok(other_reply)) => {
                let self_response = self_reply.as_ref().map(|r| &r.command_response);
                let other_response = other_reply.as_ref().map(|r| &r.command_response);

                self_response == other_response
            }
            (Err(self_err), Err(other_err)) => self_err.to_string() == other_err.to_string(),
            _ => false,
        }
    }
}

impl ServerDescription {
    /// A description for a server that has not been checked yet.
    pub(crate) fn new(address: ServerAddress) -> Self {
        Self {
            address,
            server_type: Default::default(),
            last_update_time: None,
            average_round_trip_time: None,
            reply: Ok(None),
        }
    }

    /// A description built from a successful `hello` reply. `average_rtt` is the already-smoothed
    /// round trip time maintained by the server's monitor.
    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        reply: HelloReply,
        average_rtt: Duration,
    ) -> Self {
        let server_type = reply.command_response.server_type();
        Self {
            address,
            server_type,
            last_update_time: Some(DateTime::now()),
            average_round_trip_time: Some(average_rtt),
            reply: Ok(Some(reply)),
        }
    }

    /// An Unknown description carrying the error that made the server unusable.
    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            last_update_time: Some(DateTime::now()),
            average_round_trip_time: None,
            reply: Err(error),
        }
    }

    pub(crate) fn new_possible_primary(address: ServerAddress) -> Self {
        Self {
            server_type: ServerType::PossiblePrimary,
            ..Self::new(address)
        }
    }

    /// Load balancers are never monitored; they are always selectable.
    pub(crate) fn new_load_balancer(address: ServerAddress) -> Self {
        Self {
            server_type: ServerType::LoadBalancer,
            last_update_time: Some(DateTime::now()),
            average_round_trip_time: Some(Duration::ZERO),
            ..Self::new(address)
        }
    }

    /// The address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The type of the server.
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// The smoothed round trip time to the server, if it has been successfully checked.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.average_round_trip_time
    }

    /// When the server was last checked.
    pub fn last_update_time(&self) -> Option<DateTime> {
        self.last_update_time
    }

    /// The error from the last check, if it failed.
    pub fn error(&self) -> Option<&Error> {
        self.reply.as_ref().err()
    }

    /// The replica set tags of the server.
    pub fn tags(&self) -> Option<&TagSet> {
        self.reply
            .as_ref()
            .ok()?
            .as_ref()?
            .command_response
            .tags
            .as_ref()
    }

    /// Whether this server has answered its last check, i.e. its type is not Unknown.
    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub(crate) fn compatibility_error_message(&self, driver_max_wire_version: i32) -> Option<String> {
        if let Ok(Some(ref reply)) = self.reply {
            let hello_min_wire_version = reply.command_response.min_wire_version.unwrap_or(0);

            if hello_min_wire_version > driver_max_wire_version {
                return Some(format!(
                    "Server at {} requires wire version {}, but this crate only supports up to {}",
                    self.address, hello_min_wire_version, driver_max_wire_version,
                ));
            }

            let hello_max_wire_version = reply.command_response.max_wire_version.unwrap_or(0);

            if hello_max_wire_version < DRIVER_MIN_WIRE_VERSION {
                return Some(format!(
                    "Server at {} reports wire version {}, but this crate requires at least {} \
                     (MongoDB {}).",
                    self.address,
                    hello_max_wire_version,
                    DRIVER_MIN_WIRE_VERSION,
                    DRIVER_MIN_DB_VERSION
                ));
            }
        }

        None
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>> {
        let set_name = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_name.clone());
        Ok(set_name)
    }

    /// The hosts, passives and arbiters reported by this server.
    pub(crate) fn known_hosts(&self) -> Result<Vec<ServerAddress>> {
        let reply = match self.reply.as_ref().map_err(Clone::clone)? {
            Some(reply) => reply,
            None => return Ok(Vec::new()),
        };

        let response = &reply.command_response;
        response
            .hosts
            .iter()
            .flatten()
            .chain(response.passives.iter().flatten())
            .chain(response.arbiters.iter().flatten())
            .map(ServerAddress::parse)
            .collect()
    }

    /// The address this server believes is the primary.
    pub(crate) fn primary(&self) -> Result<Option<ServerAddress>> {
        let primary = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.primary.as_ref());
        primary.map(ServerAddress::parse).transpose()
    }

    /// Whether the server reported a `me` that differs from the address it was reached at.
    pub(crate) fn invalid_me(&self) -> Result<bool> {
        if let Some(reply) = self.reply.as_ref().map_err(Clone::clone)? {
            if let Some(ref me) = reply.command_response.me {
                return Ok(ServerAddress::parse(me)? != self.address);
            }
        }

        Ok(false)
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>> {
        let set_version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_version);
        Ok(set_version)
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>> {
        let election_id = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.election_id);
        Ok(election_id)
    }

    pub(crate) fn max_wire_version(&self) -> Result<Option<i32>> {
        let version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.max_wire_version);
        Ok(version)
    }

    pub(crate) fn last_write_date(&self) -> Result<Option<DateTime>> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply
                .command_response
                .last_write
                .as_ref()
                .map(|write| write.last_write_date)),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let server_tags = match self.tags() {
            Some(tags) => tags,
            None => return tag_set.is_empty(),
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}

impl fmt::Display for ServerDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ Address: {}, Type: {}",
            self.address, self.server_type
        )?;

        if let Some(rtt) = self.average_round_trip_time {
            write!(f, ", Average RTT: {:?}", rtt)?;
        }

        match self.reply {
            Ok(Some(ref reply)) => {
                let response = &reply.command_response;
                if let Some(ref set_name) = response.set_name {
                    write!(f, ", Replica Set Name: {}", set_name)?;
                }
                if let Some(set_version) = response.set_version {
                    write!(f, ", Replica Set Version: {}", set_version)?;
                }
                if let Some(max_wire_version) = response.max_wire_version {
                    write!(f, ", Max Wire Version: {}", max_wire_version)?;
                }
                if let Some(ref tags) = response.tags {
                    write!(f, ", Tags: {:?}", tags)?;
                }
            }
            Ok(None) => {}
            Err(ref error) => write!(f, ", Error: {}", error)?,
        }

        write!(f, " }}")
    }
}
