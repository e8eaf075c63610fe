
use std::{collections::HashMap, sync::Arc, time::Duration};

use super::TopologyDescription;
use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
    sdam::{
        description::{
            server::{ServerDescription, ServerType},
            topology::TopologyType,
        },
        Server,
    },
    selection_criteria::{Eligibility, ReadPreference, SelectionCriteria, TagSet},
};

pub(crate) const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// A server chosen by selection.
///
/// The server's count of in-flight operations stays incremented for as long as this value is
/// alive, which steers concurrent selections toward less busy servers.
#[derive(Debug)]
pub struct SelectedServer {
    server: Arc<Server>,
}

impl SelectedServer {
    fn new(server: Arc<Server>) -> Self {
        server.increment_operation_count();
        Self { server }
    }

    /// The address of the selected server.
    pub fn address(&self) -> &ServerAddress {
        &self.server.address
    }

    pub(crate) fn server(&self) -> &Server {
        &self.server
    }
}

impl Drop for SelectedServer {
    fn drop(&mut self) {
        self.server.decrement_operation_count();
    }
}

/// Attempt to select a server, returning None if no server could be selected
/// that matched the provided criteria.
pub(crate) fn attempt_to_select_server<'a>(
    criteria: &'a SelectionCriteria,
    topology_description: &'a TopologyDescription,
    servers: &'a HashMap<ServerAddress, Arc<Server>>,
) -> Result<Option<SelectedServer>> {
    let in_window = topology_description.suitable_servers_in_latency_window(criteria)?;
    let in_window_servers = in_window
        .into_iter()
        .flat_map(|desc| servers.get(&desc.address))
        .collect();
    Ok(select_server_in_latency_window(in_window_servers).map(SelectedServer::new))
}

/// Choose a server from several suitable choices within the latency window: two are sampled at
/// random and the one with fewer operations in flight wins.
fn select_server_in_latency_window(in_window: Vec<&Arc<Server>>) -> Option<Arc<Server>> {
    if in_window.is_empty() {
        return None;
    } else if in_window.len() == 1 {
        return Some(in_window[0].clone());
    }

    super::choose_n(&in_window, 2)
        .min_by_key(|s| s.operation_count())
        .map(|server| (*server).clone())
}

impl TopologyDescription {
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        let servers = self
            .servers
            .values()
            .map(|server| match server.error() {
                Some(error) => format!("{} ({}: {})", server.address, server.server_type, error),
                None => format!("{} ({})", server.address, server.server_type),
            })
            .collect::<Vec<_>>()
            .join(", ");

        if self.has_available_servers() {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {}. Servers: [{}]. Topology: {}",
                criteria, servers, self
            )
        } else {
            format!(
                "Server selection timeout: No available servers. Servers: [{}]. Topology: {}",
                servers, self
            )
        }
    }

    /// The servers suitable for `criteria` whose latency is within the local threshold of the
    /// fastest one. An empty result means "try again later"; an error means retrying cannot help.
    pub(crate) fn suitable_servers_in_latency_window<'a>(
        &'a self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<&'a ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(ErrorKind::IncompatibleServer {
                message: message.to_string(),
            }
            .into());
        }

        let mut suitable_servers = match criteria {
            SelectionCriteria::ReadPreference(ref read_pref) => self.suitable_servers(read_pref)?,
            SelectionCriteria::Predicate(ref filter) => self
                .servers
                .values()
                .filter(|s| {
                    // A direct connection ignores whether its one server is data-bearing.
                    (self.topology_type == TopologyType::Single || s.server_type.is_data_bearing())
                        && filter(*s)
                })
                .collect(),
        };

        self.retain_servers_within_latency_window(&mut suitable_servers);

        Ok(suitable_servers)
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|server| server.is_available())
    }

    fn suitable_servers(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let servers = match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single => self.servers.values().filter(|s| s.is_available()).collect(),
            TopologyType::LoadBalanced => self.servers.values().collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.suitable_servers_in_replica_set(read_preference)?
            }
        };

        Ok(servers)
    }

    fn retain_servers_within_latency_window(&self, suitable_servers: &mut Vec<&ServerDescription>) {
        let shortest_average_rtt = suitable_servers
            .iter()
            .filter_map(|server_desc| server_desc.average_round_trip_time)
            .min();

        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let max_rtt_within_window = shortest_average_rtt
            .map(|rtt| rtt.checked_add(local_threshold).unwrap_or(Duration::MAX));

        suitable_servers.retain(move |server_desc| {
            match (server_desc.average_round_trip_time, max_rtt_within_window) {
                (Some(server_rtt), Some(max_rtt)) => server_rtt <= max_rtt,
                // Load balancers are not monitored, so they may have no RTT at all.
                _ => matches!(server_desc.server_type, ServerType::LoadBalancer),
            }
        });
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    /// The current primary, if the topology has one.
    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers_with_type(&[ServerType::RsPrimary]).next()
    }

    fn suitable_servers_in_replica_set(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        if let Some(max_staleness) = read_preference.max_staleness() {
            super::verify_max_staleness(
                max_staleness,
                self.heartbeat_frequency(),
                self.idle_write_period(),
            )?;
        }

        let (preferred, fallback) = read_preference.eligibility();
        let servers = self.eligible_servers(preferred, read_preference);
        Ok(match fallback {
            Some(fallback) if servers.is_empty() => {
                self.eligible_servers(fallback, read_preference)
            }
            _ => servers,
        })
    }

    fn eligible_servers(
        &self,
        eligibility: Eligibility,
        read_preference: &ReadPreference,
    ) -> Vec<&ServerDescription> {
        let types = match eligibility {
            Eligibility::Primary => return self.primary().into_iter().collect(),
            Eligibility::Filtered(types) => types,
        };

        let mut servers = self.servers_with_type(types).collect();
        if let Some(max_staleness) = read_preference.max_staleness() {
            self.filter_servers_by_max_staleness(&mut servers, max_staleness);
        }
        if let Some(tag_sets) = read_preference.tag_sets() {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }
        servers
    }

    /// Drops the secondaries whose estimated lag exceeds `max_staleness`. The estimate is made
    /// against the primary when there is one, and against the freshest secondary otherwise. The
    /// primary itself is never stale.
    fn filter_servers_by_max_staleness(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let heartbeat = millis(self.heartbeat_frequency());
        let max_staleness = millis(max_staleness);

        let reference = match self.primary() {
            Some(primary) => match (primary.last_update_time, last_write_millis(primary)) {
                // How far the primary's last write trailed the moment it was observed.
                (Some(update), Some(write)) => StalenessReference::Primary {
                    lag: update.timestamp_millis() - write,
                },
                _ => StalenessReference::Unknown,
            },
            None => match self
                .servers_with_type(&[ServerType::RsSecondary])
                .filter_map(last_write_millis)
                .max()
            {
                Some(freshest_write) => StalenessReference::FreshestSecondary { freshest_write },
                // Nothing to compare against, so nothing is filtered.
                None => return,
            },
        };

        servers.retain(|server| {
            if server.server_type == ServerType::RsPrimary {
                return true;
            }
            let write = match last_write_millis(server) {
                Some(write) => write,
                None => return false,
            };
            let staleness = match reference {
                StalenessReference::Primary { lag } => match server.last_update_time {
                    Some(update) => (update.timestamp_millis() - write) - lag + heartbeat,
                    None => return false,
                },
                StalenessReference::FreshestSecondary { freshest_write } => {
                    freshest_write - write + heartbeat
                }
                StalenessReference::Unknown => return false,
            };
            staleness <= max_staleness
        })
    }
}

#[derive(Clone, Copy)]
enum StalenessReference {
    Primary { lag: i64 },
    FreshestSecondary { freshest_write: i64 },
    Unknown,
}

fn millis(duration: Duration) -> i64 {
    duration.as_millis().try_into().unwrap_or(i64::MAX)
}

fn last_write_millis(server: &ServerDescription) -> Option<i64> {
    server
        .last_write_date()
        .ok()
        .flatten()
        .map(|date| date.timestamp_millis())
}

/// Keeps the servers matching the first tag set that matches any of them. An empty list of tag
/// sets keeps everything; a list where no set matches keeps nothing.
fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matches_tag_set = |server: &&ServerDescription| server.matches_tag_set(tag_set);

        if servers.iter().any(matches_tag_set) {
            servers.retain(matches_tag_set);

            return;
        }
    }

    servers.clear();
}
