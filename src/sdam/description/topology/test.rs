use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::{
    bson::{oid::ObjectId, Document},
    error::Error,
    hello::HelloReply,
    options::{ClusterOptions, ServerAddress},
    sdam::description::{
        server::{ServerDescription, ServerType},
        topology::{verify_max_staleness, TopologyDescription, TopologyType},
    },
    test::{mongos_reply, primary_reply, secondary_reply, standalone_reply},
};

pub(crate) fn address(host: &str) -> ServerAddress {
    ServerAddress::parse(host).unwrap()
}

/// A description of `address` as if its monitor had just received `reply`.
pub(crate) fn described(address: &ServerAddress, reply: Document, rtt: Duration) -> ServerDescription {
    ServerDescription::new_from_hello_reply(
        address.clone(),
        HelloReply::parse(address.clone(), reply).unwrap(),
        rtt,
    )
}

pub(crate) fn election_id(n: u8) -> ObjectId {
    let mut bytes = [0; 12];
    bytes[11] = n;
    ObjectId::from_bytes(bytes)
}

fn topology(hosts: &[&ServerAddress]) -> TopologyDescription {
    TopologyDescription::new(
        &ClusterOptions::builder()
            .hosts(hosts.iter().map(|h| (*h).clone()).collect())
            .build(),
    )
}

fn update(topology: &mut TopologyDescription, address: &ServerAddress, reply: Document) {
    topology
        .update(described(address, reply, Duration::from_millis(10)))
        .unwrap();
}

fn server_type(topology: &TopologyDescription, address: &ServerAddress) -> Option<ServerType> {
    topology
        .get_server_description(address)
        .map(|s| s.server_type())
}

fn primaries(topology: &TopologyDescription) -> usize {
    topology
        .servers()
        .filter(|s| s.server_type() == ServerType::RsPrimary)
        .count()
}

#[test]
fn initial_topology_type() {
    let a = address("a");
    let b = address("b");

    assert_eq!(topology(&[&a]).topology_type(), TopologyType::Unknown);

    let options = ClusterOptions::builder()
        .hosts(vec![a.clone()])
        .repl_set_name("rs".to_string())
        .build();
    assert_eq!(
        TopologyDescription::new(&options).topology_type(),
        TopologyType::ReplicaSetNoPrimary
    );

    let options = ClusterOptions::builder()
        .hosts(vec![a.clone()])
        .direct_connection(true)
        .build();
    assert_eq!(
        TopologyDescription::new(&options).topology_type(),
        TopologyType::Single
    );

    let options = ClusterOptions::builder()
        .hosts(vec![a.clone()])
        .load_balanced(true)
        .build();
    let description = TopologyDescription::new(&options);
    assert_eq!(description.topology_type(), TopologyType::LoadBalanced);
    let lb = description.get_server_description(&a).unwrap();
    assert_eq!(lb.server_type(), ServerType::LoadBalancer);
    assert_eq!(lb.average_round_trip_time(), Some(Duration::ZERO));

    let description = topology(&[&a, &b]);
    assert_eq!(description.servers().count(), 2);
    assert!(description
        .servers()
        .all(|s| s.server_type() == ServerType::Unknown));
}

#[test]
fn single_seed_standalone_becomes_single() {
    let a = address("a");
    let mut description = topology(&[&a]);

    update(&mut description, &a, standalone_reply());

    assert_eq!(description.topology_type(), TopologyType::Single);
    assert_eq!(server_type(&description, &a), Some(ServerType::Standalone));
}

#[test]
fn standalone_among_several_seeds_is_removed() {
    let a = address("a");
    let b = address("b");
    let mut description = topology(&[&a, &b]);

    update(&mut description, &a, standalone_reply());

    assert_eq!(description.topology_type(), TopologyType::Unknown);
    assert_eq!(server_type(&description, &a), None);
    assert_eq!(server_type(&description, &b), Some(ServerType::Unknown));
}

#[test]
fn ghost_moves_unknown_topology_to_no_primary() {
    let a = address("a");
    let b = address("b");
    let mut description = topology(&[&a, &b]);

    let mut ghost = standalone_reply();
    ghost.insert("isWritablePrimary", false);
    ghost.insert("isreplicaset", true);
    // A ghost's host list is not trusted.
    ghost.insert("hosts", vec!["c:27017"]);
    update(&mut description, &a, ghost);

    assert_eq!(description.topology_type(), TopologyType::ReplicaSetNoPrimary);
    assert_eq!(description.set_name(), None);
    assert_eq!(server_type(&description, &a), Some(ServerType::RsGhost));
    assert_eq!(server_type(&description, &b), Some(ServerType::Unknown));
    assert_eq!(server_type(&description, &address("c")), None);
    assert_eq!(description.servers().count(), 2);
}

#[test]
fn primary_discovers_members() {
    let a = address("a");
    let b = address("b");
    let c = address("c");
    let mut description = topology(&[&a]);

    update(
        &mut description,
        &a,
        primary_reply("rs", &a, &[&a, &b, &c], 1, election_id(1)),
    );

    assert_eq!(description.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(description.set_name(), Some("rs"));
    assert_eq!(description.servers().count(), 3);
    assert_eq!(server_type(&description, &b), Some(ServerType::Unknown));
    assert_eq!(description.primary().map(|p| p.address()), Some(&a));
}

#[test]
fn primary_removes_unlisted_members() {
    let a = address("a");
    let b = address("b");
    let c = address("c");
    let mut description = topology(&[&a, &b, &c]);

    update(
        &mut description,
        &a,
        primary_reply("rs", &a, &[&a, &b], 1, election_id(1)),
    );

    assert_eq!(server_type(&description, &c), None);
    assert_eq!(description.servers().count(), 2);
}

#[test]
fn newer_primary_demotes_old_one() {
    let a = address("a");
    let b = address("b");
    let mut description = topology(&[&a, &b]);

    update(
        &mut description,
        &a,
        primary_reply("rs", &a, &[&a, &b], 1, election_id(1)),
    );
    update(
        &mut description,
        &b,
        primary_reply("rs", &b, &[&a, &b], 1, election_id(2)),
    );

    assert_eq!(primaries(&description), 1);
    assert_eq!(server_type(&description, &a), Some(ServerType::Unknown));
    assert_eq!(server_type(&description, &b), Some(ServerType::RsPrimary));
    assert_eq!(description.max_election_id, Some(election_id(2)));
}

#[test]
fn stale_primary_is_rejected() {
    let a = address("a");
    let b = address("b");
    let mut description = topology(&[&a, &b]);

    update(
        &mut description,
        &b,
        primary_reply("rs", &b, &[&a, &b], 1, election_id(2)),
    );
    // `a` still believes it won the previous election.
    update(
        &mut description,
        &a,
        primary_reply("rs", &a, &[&a, &b], 1, election_id(1)),
    );

    assert_eq!(primaries(&description), 1);
    assert_eq!(server_type(&description, &a), Some(ServerType::Unknown));
    assert_eq!(server_type(&description, &b), Some(ServerType::RsPrimary));
    assert_eq!(description.max_election_id, Some(election_id(2)));
}

#[test]
fn higher_set_version_wins_over_election_id() {
    let a = address("a");
    let b = address("b");
    let mut description = topology(&[&a, &b]);

    update(
        &mut description,
        &a,
        primary_reply("rs", &a, &[&a, &b], 2, election_id(1)),
    );
    update(
        &mut description,
        &b,
        primary_reply("rs", &b, &[&a, &b], 1, election_id(9)),
    );

    assert_eq!(server_type(&description, &a), Some(ServerType::RsPrimary));
    assert_eq!(server_type(&description, &b), Some(ServerType::Unknown));
    assert_eq!(description.max_set_version, Some(2));
}

#[test]
fn primary_uniqueness_under_interleaved_reports() {
    let hosts = [address("a"), address("b"), address("c")];
    let members: Vec<&ServerAddress> = hosts.iter().collect();
    let mut description = topology(&members);

    let reports = [(0, 1), (1, 3), (2, 2), (0, 4), (1, 4), (2, 5), (0, 1)];
    for (member, election) in reports {
        let me = &hosts[member];
        update(
            &mut description,
            me,
            primary_reply("rs", me, &members, 1, election_id(election)),
        );
        assert!(primaries(&description) <= 1, "{description}");
    }

    assert_eq!(description.primary().map(|p| p.address()), Some(&hosts[2]));
}

#[test]
fn losing_primary_leaves_no_primary() {
    let a = address("a");
    let b = address("b");
    let mut description = topology(&[&a, &b]);

    update(
        &mut description,
        &a,
        primary_reply("rs", &a, &[&a, &b], 1, election_id(1)),
    );
    description
        .update(ServerDescription::new_from_error(
            a.clone(),
            std::io::ErrorKind::ConnectionReset.into(),
        ))
        .unwrap();

    assert_eq!(description.topology_type(), TopologyType::ReplicaSetNoPrimary);
    assert!(description.get_server_description(&a).unwrap().error().is_some());
}

#[test]
fn secondary_names_possible_primary() {
    let a = address("a");
    let b = address("b");
    let options = ClusterOptions::builder()
        .hosts(vec![a.clone()])
        .repl_set_name("rs".to_string())
        .build();
    let mut description = TopologyDescription::new(&options);

    update(
        &mut description,
        &a,
        secondary_reply("rs", &a, &[&a, &b], Some(&b)),
    );

    assert_eq!(description.topology_type(), TopologyType::ReplicaSetNoPrimary);
    assert_eq!(server_type(&description, &a), Some(ServerType::RsSecondary));
    assert_eq!(server_type(&description, &b), Some(ServerType::PossiblePrimary));
}

#[test]
fn member_of_other_set_is_removed() {
    let a = address("a");
    let b = address("b");
    let options = ClusterOptions::builder()
        .hosts(vec![a.clone(), b.clone()])
        .repl_set_name("rs".to_string())
        .build();
    let mut description = TopologyDescription::new(&options);

    update(
        &mut description,
        &b,
        secondary_reply("other", &b, &[&b], None),
    );

    assert_eq!(server_type(&description, &b), None);
    assert_eq!(description.set_name(), Some("rs"));
}

#[test]
fn member_with_wrong_me_is_removed() {
    let a = address("a");
    let x = address("x");
    let mut description = topology(&[&a]);

    update(&mut description, &a, secondary_reply("rs", &x, &[&x], None));

    assert_eq!(server_type(&description, &a), None);
    assert_eq!(server_type(&description, &x), Some(ServerType::Unknown));
}

#[test]
fn direct_connection_checks_set_name() {
    let a = address("a");
    let options = ClusterOptions::builder()
        .hosts(vec![a.clone()])
        .direct_connection(true)
        .repl_set_name("rs".to_string())
        .build();
    let mut description = TopologyDescription::new(&options);

    update(&mut description, &a, standalone_reply());

    let server = description.get_server_description(&a).unwrap();
    assert_eq!(server.server_type(), ServerType::Unknown);
    assert!(server.error().is_some());
    assert_eq!(description.topology_type(), TopologyType::Single);
}

#[test]
fn sharded_is_monotonic() {
    let a = address("a");
    let b = address("b");
    let mut description = topology(&[&a, &b]);

    update(&mut description, &a, mongos_reply());
    assert_eq!(description.topology_type(), TopologyType::Sharded);

    update(
        &mut description,
        &b,
        primary_reply("rs", &b, &[&b], 1, election_id(1)),
    );
    assert_eq!(description.topology_type(), TopologyType::Sharded);
    assert_eq!(server_type(&description, &b), None);

    description
        .update(ServerDescription::new_from_error(
            a.clone(),
            Error::internal("check failed"),
        ))
        .unwrap();
    assert_eq!(description.topology_type(), TopologyType::Sharded);
    assert_eq!(server_type(&description, &a), Some(ServerType::Unknown));
}

#[test]
fn load_balanced_is_monotonic() {
    let a = address("a");
    let options = ClusterOptions::builder()
        .hosts(vec![a.clone()])
        .load_balanced(true)
        .build();
    let mut description = TopologyDescription::new(&options);

    update(&mut description, &a, standalone_reply());

    assert_eq!(description.topology_type(), TopologyType::LoadBalanced);
    assert_eq!(server_type(&description, &a), Some(ServerType::LoadBalancer));
}

#[test]
fn reports_for_unknown_addresses_are_ignored() {
    let a = address("a");
    let stranger = address("stranger");
    let mut description = topology(&[&a]);

    update(&mut description, &stranger, standalone_reply());

    assert_eq!(description.topology_type(), TopologyType::Unknown);
    assert_eq!(server_type(&description, &stranger), None);
}

#[test]
fn wire_version_compatibility() {
    let a = address("a");
    let mut description = topology(&[&a]);

    let mut too_old = standalone_reply();
    too_old.insert("maxWireVersion", 2);
    update(&mut description, &a, too_old);
    assert!(description.compatibility_error().is_some());

    let mut too_new = standalone_reply();
    too_new.insert("minWireVersion", 100);
    too_new.insert("maxWireVersion", 110);
    update(&mut description, &a, too_new);
    assert!(description
        .compatibility_error()
        .unwrap()
        .contains("requires wire version 100"));

    update(&mut description, &a, standalone_reply());
    assert_eq!(description.compatibility_error(), None);
}

#[test]
fn apply_leaves_original_untouched() {
    let a = address("a");
    let b = address("b");
    let description = topology(&[&a]);

    let updated = description
        .apply(described(
            &a,
            primary_reply("rs", &a, &[&a, &b], 1, election_id(1)),
            Duration::from_millis(1),
        ))
        .unwrap();

    assert_eq!(description.topology_type(), TopologyType::Unknown);
    assert_eq!(description.servers().count(), 1);
    assert_eq!(updated.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(updated.servers().count(), 2);
}

#[test]
fn diff_reports_changes() {
    let a = address("a");
    let b = address("b");
    let c = address("c");
    let description = topology(&[&a, &c]);
    assert!(description.diff(&description.clone()).is_none());

    let updated = description
        .apply(described(
            &a,
            primary_reply("rs", &a, &[&a, &b], 1, election_id(1)),
            Duration::from_millis(1),
        ))
        .unwrap();

    let diff = description.diff(&updated).unwrap();
    assert_eq!(diff.added_addresses.into_iter().collect::<Vec<_>>(), vec![&b]);
    assert_eq!(diff.removed_addresses.into_iter().collect::<Vec<_>>(), vec![&c]);
    let (old, new) = diff.changed_servers[&a];
    assert_eq!(old.server_type(), ServerType::Unknown);
    assert_eq!(new.server_type(), ServerType::RsPrimary);
}

#[test]
fn max_staleness_lower_bound() {
    let heartbeat = Duration::from_secs(10);
    let idle_write_period = Duration::from_secs(10);

    assert!(verify_max_staleness(Duration::from_secs(90), heartbeat, idle_write_period).is_ok());
    assert!(verify_max_staleness(Duration::from_secs(89), heartbeat, idle_write_period).is_err());

    let slow_heartbeat = Duration::from_secs(100);
    assert!(
        verify_max_staleness(Duration::from_secs(100), slow_heartbeat, idle_write_period)
            .is_err()
    );
    assert!(
        verify_max_staleness(Duration::from_secs(110), slow_heartbeat, idle_write_period).is_ok()
    );
}
