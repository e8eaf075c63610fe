use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::options::{ClusterOptions, ServerAddress};

#[test]
fn parse_address_lowercases_host() {
    let address = ServerAddress::parse("Example.COM:27018").unwrap();
    assert_eq!(address.host(), "example.com");
    assert_eq!(address.port(), Some(27018));
    assert_eq!(address.to_string(), "example.com:27018");
}

#[test]
fn default_port_is_normalized() {
    let explicit = ServerAddress::parse("a:27017").unwrap();
    let implicit = ServerAddress::parse("a").unwrap();
    assert_eq!(explicit, implicit);
    assert_eq!(implicit.to_string(), "a:27017");

    let mut set = std::collections::HashSet::new();
    set.insert(explicit);
    assert!(set.contains(&implicit));
}

#[test]
fn invalid_addresses() {
    assert!(ServerAddress::parse("").is_err());
    assert!(ServerAddress::parse("a:b").is_err());
    assert!(ServerAddress::parse("a:0").is_err());
    assert!(ServerAddress::parse("a:1:2").is_err());
    assert!(ServerAddress::parse("a:70000").is_err());
}

#[test]
fn parse_connection_string() {
    let options = ClusterOptions::parse(
        "mongodb://A:27017,b:27018/?replicaSet=rs%30&heartbeatFrequencyMS=1000&localThresholdMS=\
         20&maxPoolSize=5&minPoolSize=1&serverSelectionTimeoutMS=2000&maxIdleTimeMS=0",
    )
    .unwrap();

    assert_eq!(
        options.hosts,
        vec![
            ServerAddress::parse("a:27017").unwrap(),
            ServerAddress::parse("b:27018").unwrap()
        ]
    );
    assert_eq!(options.repl_set_name.as_deref(), Some("rs0"));
    assert_eq!(options.heartbeat_freq, Some(Duration::from_secs(1)));
    assert_eq!(options.local_threshold, Some(Duration::from_millis(20)));
    assert_eq!(options.max_pool_size, Some(5));
    assert_eq!(options.min_pool_size, Some(1));
    assert_eq!(
        options.server_selection_timeout,
        Some(Duration::from_secs(2))
    );
    assert_eq!(options.max_idle_time, Some(Duration::ZERO));
}

#[test]
fn connection_string_rejects_low_heartbeat() {
    let error = ClusterOptions::parse("mongodb://a/?heartbeatFrequencyMS=499").unwrap_err();
    assert!(error.is_invalid_argument());
}

#[test]
fn connection_string_requires_scheme_and_hosts() {
    assert!(ClusterOptions::parse("localhost:27017").is_err());
    assert!(ClusterOptions::parse("mongodb:///?replicaSet=rs").is_err());
    assert!(ClusterOptions::parse("mongodb://a?replicaSet=rs").is_err());
}

#[test]
fn connection_string_ignores_unknown_options() {
    let options = ClusterOptions::parse("mongodb://user:pass@a/db?appName=test").unwrap();
    assert_eq!(options.hosts, vec![ServerAddress::parse("a").unwrap()]);
}

#[test]
fn validate() {
    let two_hosts = vec![
        ServerAddress::parse("a").unwrap(),
        ServerAddress::parse("b").unwrap(),
    ];

    let direct = ClusterOptions::builder()
        .hosts(two_hosts.clone())
        .direct_connection(true)
        .build();
    assert!(direct.validate().is_err());

    let load_balanced = ClusterOptions::builder()
        .hosts(two_hosts)
        .load_balanced(true)
        .build();
    assert!(load_balanced.validate().is_err());

    let load_balanced_set = ClusterOptions::builder()
        .load_balanced(true)
        .repl_set_name("rs".to_string())
        .build();
    assert!(load_balanced_set.validate().is_err());

    let pool_sizes = ClusterOptions::builder()
        .min_pool_size(5)
        .max_pool_size(2)
        .build();
    assert!(pool_sizes.validate().is_err());

    let heartbeat = ClusterOptions::builder()
        .heartbeat_freq(Duration::from_millis(100))
        .build();
    assert!(heartbeat.validate().is_err());

    assert!(ClusterOptions::default().validate().is_ok());
}
