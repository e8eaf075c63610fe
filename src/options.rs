//! Contains the options used to configure a [`Cluster`](crate::Cluster).

#[cfg(test)]
mod test;

use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use derive_where::derive_where;
use percent_encoding::percent_decode_str;
use serde::{de::Error as SerdeError, Deserialize, Deserializer, Serialize, Serializer};
use typed_builder::TypedBuilder;

use crate::{
    cmap::Authenticator,
    error::{Error, ErrorKind, Result},
    event::{cmap::CmapEventHandler, sdam::SdamEventHandler},
    sdam::{DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
};

/// The default port used when an address does not specify one.
pub const DEFAULT_PORT: u16 = 27017;

const URI_SCHEME: &str = "mongodb://";

/// An enum representing the address of a MongoDB server.
#[derive(Clone, Debug, Eq)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the MongoDB server can be found.
        host: String,

        /// The TCP port that the MongoDB server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| D::Error::custom(format!("{}", e)))
    }
}

impl Serialize for ServerAddress {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => {
                host == other_host
                    && port.unwrap_or(DEFAULT_PORT) == other_port.unwrap_or(DEFAULT_PORT)
            }
        }
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        match self {
            Self::Tcp { host, port } => {
                host.hash(state);
                port.unwrap_or(DEFAULT_PORT).hash(state);
            }
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`. The host is normalized to lowercase.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let invalid = || Error::invalid_argument(format!("invalid server address: \"{address}\""));

        let (hostname, port) = match address.rsplit_once(':') {
            Some((hostname, port)) => {
                let port = u16::from_str(port).map_err(|_| invalid())?;
                if port == 0 {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address: \"{address}\"; port must be non-zero"
                    )));
                }
                (hostname, Some(port))
            }
            None => (address, None),
        };

        if hostname.is_empty() || hostname.contains(':') {
            return Err(invalid());
        }

        Ok(Self::Tcp {
            host: hostname.to_lowercase(),
            port,
        })
    }

    /// The hostname or IP address of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    /// The port of this address, if one was specified.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
        }
    }
}

/// Contains the options that can be used to create a new [`Cluster`](crate::Cluster).
#[derive(Clone, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[derive_where(Debug)]
#[non_exhaustive]
pub struct ClusterOptions {
    /// The initial list of seeds that the cluster should connect to.
    ///
    /// The default value is a single seed at `localhost:27017`.
    #[builder(default_code = "vec![ServerAddress::default()]", setter(!into))]
    pub hosts: Vec<ServerAddress>,

    /// The name of the replica set that the cluster should connect to. When set, the topology
    /// starts as `ReplicaSetNoPrimary` and members reporting any other set name are removed.
    pub repl_set_name: Option<String>,

    /// The amount of time each monitoring task should wait between performing server checks.
    ///
    /// The default value is 10 seconds; the minimum is 500 milliseconds.
    pub heartbeat_freq: Option<Duration>,

    /// The minimum amount of time between two checks of the same server, even when an immediate
    /// check has been requested.
    ///
    /// The default value is 500 milliseconds.
    pub min_heartbeat_freq: Option<Duration>,

    /// The connect timeout passed to each underlying connection. Monitoring checks are bounded by
    /// this value as well.
    ///
    /// The default value is 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// The amount of time `select_server` waits for a suitable server before failing.
    ///
    /// The default value is 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// The maximum number of connections each server's pool may manage, including those in use.
    ///
    /// The default value is 10.
    pub max_pool_size: Option<u32>,

    /// The minimum number of connections each server's pool keeps open once the server is known
    /// to be available.
    pub min_pool_size: Option<u32>,

    /// The amount of time a connection may sit idle in a pool before being closed. Zero means no
    /// limit.
    pub max_idle_time: Option<Duration>,

    /// The latency window above the fastest suitable server within which servers are considered
    /// for selection.
    ///
    /// The default value is 15 milliseconds.
    pub local_threshold: Option<Duration>,

    /// Connect directly to the single seed instead of discovering the deployment.
    pub direct_connection: Option<bool>,

    /// Whether the single seed is a load balancer. Load-balanced clusters do not monitor servers.
    pub load_balanced: Option<bool>,

    /// The period at which primaries write a no-op when idle, used as the correction term when
    /// validating a maximum staleness.
    ///
    /// The default value is 10 seconds.
    pub idle_write_period: Option<Duration>,

    /// The highest wire version this cluster is able to speak. Servers whose minimum wire version
    /// exceeds this value make the whole deployment incompatible.
    pub max_wire_version: Option<i32>,

    /// The handler that should process all Server Discovery and Monitoring events.
    #[derive_where(skip)]
    pub sdam_event_handler: Option<Arc<dyn SdamEventHandler>>,

    /// The handler that should process all Connection Monitoring and Pooling events.
    #[derive_where(skip)]
    pub cmap_event_handler: Option<Arc<dyn CmapEventHandler>>,

    /// Authentication performed once on each new pooled connection after the handshake.
    #[derive_where(skip)]
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClusterOptions {
    /// Parses a `mongodb://` connection string into `ClusterOptions`.
    ///
    /// Only the host list and the options relevant to discovery, monitoring, selection and
    /// pooling are interpreted; other options are ignored.
    pub fn parse(uri: impl AsRef<str>) -> Result<Self> {
        let uri = uri.as_ref();
        let after_scheme = uri.strip_prefix(URI_SCHEME).ok_or_else(|| {
            Error::invalid_argument(format!("connection string must start with {URI_SCHEME}"))
        })?;

        let (host_section, options_section) = match after_scheme.find('/') {
            Some(index) => {
                let (hosts, rest) = after_scheme.split_at(index);
                let options = rest[1..].split_once('?').map(|(_, options)| options);
                (hosts, options)
            }
            None => {
                if after_scheme.contains('?') {
                    return Err(Error::invalid_argument(
                        "connection string must contain a '/' before the options",
                    ));
                }
                (after_scheme, None)
            }
        };

        let host_section = match host_section.rfind('@') {
            Some(index) => &host_section[index + 1..],
            None => host_section,
        };

        if host_section.is_empty() {
            return Err(Error::invalid_argument("connection string contains no hosts"));
        }

        let hosts = host_section
            .split(',')
            .map(ServerAddress::parse)
            .collect::<Result<Vec<_>>>()?;

        let mut options = ClusterOptions::builder().hosts(hosts).build();

        if let Some(options_section) = options_section {
            for pair in options_section.split('&').filter(|s| !s.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    Error::invalid_argument(format!(
                        "connection string option is not a 'key=value' pair: {pair}"
                    ))
                })?;
                let value = percent_decode_str(value)
                    .decode_utf8()
                    .map_err(|_| {
                        Error::invalid_argument(format!(
                            "connection string option {key} is not valid UTF-8"
                        ))
                    })?;
                options.parse_option_pair(&key.to_lowercase(), value.as_ref())?;
            }
        }

        options.validate()?;
        Ok(options)
    }

    fn parse_option_pair(&mut self, key: &str, value: &str) -> Result<()> {
        macro_rules! get_duration {
            ($value:expr, $option:expr) => {
                match u64::from_str_radix($value, 10) {
                    Ok(i) => i,
                    _ => {
                        return Err(ErrorKind::InvalidArgument {
                            message: format!(
                                "connection string `{}` option must be a non-negative integer",
                                $option
                            ),
                        }
                        .into())
                    }
                }
            };
        }

        macro_rules! get_u32 {
            ($value:expr, $option:expr) => {
                match u32::from_str_radix($value, 10) {
                    Ok(u) => u,
                    Err(_) => {
                        return Err(ErrorKind::InvalidArgument {
                            message: format!(
                                "connection string `{}` argument must be a positive integer",
                                $option,
                            ),
                        }
                        .into())
                    }
                }
            };
        }

        macro_rules! get_bool {
            ($value:expr, $option:expr) => {
                match $value {
                    "true" => true,
                    "false" => false,
                    _ => {
                        return Err(ErrorKind::InvalidArgument {
                            message: format!(
                                "connection string `{}` option must be a boolean",
                                $option,
                            ),
                        }
                        .into())
                    }
                }
            };
        }

        match key {
            k @ "connecttimeoutms" => {
                self.connect_timeout = Some(Duration::from_millis(get_duration!(value, k)));
            }
            k @ "directconnection" => {
                self.direct_connection = Some(get_bool!(value, k));
            }
            k @ "heartbeatfrequencyms" => {
                let duration = get_duration!(value, k);

                if duration < MIN_HEARTBEAT_FREQUENCY.as_millis() as u64 {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "'heartbeatFrequencyMS' must be at least 500, but {} was given",
                            duration
                        ),
                    }
                    .into());
                }

                self.heartbeat_freq = Some(Duration::from_millis(duration));
            }
            k @ "loadbalanced" => {
                self.load_balanced = Some(get_bool!(value, k));
            }
            k @ "localthresholdms" => {
                self.local_threshold = Some(Duration::from_millis(get_duration!(value, k)))
            }
            k @ "maxidletimems" => {
                self.max_idle_time = Some(Duration::from_millis(get_duration!(value, k)));
            }
            k @ "maxpoolsize" => {
                self.max_pool_size = Some(get_u32!(value, k));
            }
            k @ "minpoolsize" => {
                self.min_pool_size = Some(get_u32!(value, k));
            }
            "replicaset" => {
                self.repl_set_name = Some(value.to_string());
            }
            k @ "serverselectiontimeoutms" => {
                self.server_selection_timeout = Some(Duration::from_millis(get_duration!(value, k)))
            }
            other => {
                tracing::warn!(
                    target: crate::trace::TOPOLOGY_TRACING_EVENT_TARGET,
                    option = other,
                    "ignoring unsupported connection string option"
                );
            }
        }

        Ok(())
    }

    /// Ensure the options set are valid, returning an error describing the problem if they are not.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::invalid_argument("at least one host must be specified"));
        }

        if self.direct_connection == Some(true) && self.hosts.len() > 1 {
            return Err(Error::invalid_argument(
                "cannot specify multiple seeds with directConnection=true",
            ));
        }

        if self.load_balanced == Some(true) {
            if self.hosts.len() > 1 {
                return Err(Error::invalid_argument(
                    "cannot specify multiple seeds with loadBalanced=true",
                ));
            }
            if self.repl_set_name.is_some() {
                return Err(Error::invalid_argument(
                    "cannot specify replicaSet with loadBalanced=true",
                ));
            }
            if self.direct_connection == Some(true) {
                return Err(Error::invalid_argument(
                    "cannot specify directConnection=true with loadBalanced=true",
                ));
            }
        }

        if let Some(heartbeat_freq) = self.heartbeat_freq {
            if heartbeat_freq < MIN_HEARTBEAT_FREQUENCY {
                return Err(Error::invalid_argument(format!(
                    "'heartbeat_freq' must be at least {}ms, but {}ms was given",
                    MIN_HEARTBEAT_FREQUENCY.as_millis(),
                    heartbeat_freq.as_millis()
                )));
            }
        }

        if let (Some(min), Some(max)) = (self.min_pool_size, self.max_pool_size) {
            if max != 0 && min > max {
                return Err(Error::invalid_argument(format!(
                    "min_pool_size ({}) is greater than max_pool_size ({})",
                    min, max
                )));
            }
        }

        Ok(())
    }

    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    pub(crate) fn min_heartbeat_frequency(&self) -> Duration {
        self.min_heartbeat_freq.unwrap_or(MIN_HEARTBEAT_FREQUENCY)
    }
}
