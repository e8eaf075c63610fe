use pretty_assertions::assert_eq;

use crate::{
    bson::doc,
    hello::{hello_command, HelloReply},
    options::ServerAddress,
    sdam::ServerType,
};

fn server_type(reply: crate::bson::Document) -> ServerType {
    HelloReply::parse(ServerAddress::default(), reply)
        .unwrap()
        .command_response
        .server_type()
}

#[test]
fn decision_table() {
    assert_eq!(server_type(doc! { "ok": 1, "msg": "isdbgrid" }), ServerType::Mongos);
    assert_eq!(
        server_type(doc! { "ok": 1, "setName": "rs", "isWritablePrimary": true }),
        ServerType::RsPrimary
    );
    assert_eq!(
        server_type(doc! { "ok": 1, "setName": "rs", "ismaster": true }),
        ServerType::RsPrimary
    );
    assert_eq!(
        server_type(doc! { "ok": 1, "setName": "rs", "isWritablePrimary": true, "hidden": true }),
        ServerType::RsOther
    );
    assert_eq!(
        server_type(doc! { "ok": 1, "setName": "rs", "secondary": true }),
        ServerType::RsSecondary
    );
    assert_eq!(
        server_type(doc! { "ok": 1, "setName": "rs", "arbiterOnly": true }),
        ServerType::RsArbiter
    );
    assert_eq!(server_type(doc! { "ok": 1, "setName": "rs" }), ServerType::RsOther);
    assert_eq!(server_type(doc! { "ok": 1, "isreplicaset": true }), ServerType::RsGhost);
    assert_eq!(
        server_type(doc! { "ok": 1, "isWritablePrimary": true }),
        ServerType::Standalone
    );
}

#[test]
fn host_names_are_lowercased() {
    let reply = HelloReply::parse(
        ServerAddress::default(),
        doc! {
            "ok": 1,
            "setName": "rs",
            "hosts": ["A:27017", "b:27017"],
            "arbiters": ["C:27017"],
            "primary": "A:27017",
            "me": "B:27017",
        },
    )
    .unwrap();

    let response = reply.command_response;
    assert_eq!(
        response.hosts,
        Some(vec!["a:27017".to_string(), "b:27017".to_string()])
    );
    assert_eq!(response.arbiters, Some(vec!["c:27017".to_string()]));
    assert_eq!(response.primary.as_deref(), Some("a:27017"));
    assert_eq!(response.me.as_deref(), Some("b:27017"));
}

#[test]
fn malformed_reply_is_an_error() {
    let error = HelloReply::parse(ServerAddress::default(), doc! { "ok": 1, "hosts": 5 })
        .unwrap_err();
    assert!(matches!(
        *error.kind,
        crate::error::ErrorKind::InvalidResponse { .. }
    ));
}

#[test]
fn command_shape() {
    assert_eq!(hello_command(None), doc! { "hello": 1, "helloOk": true });
    assert_eq!(
        hello_command(Some(true)),
        doc! { "hello": 1, "helloOk": true, "loadBalanced": true }
    );
}
