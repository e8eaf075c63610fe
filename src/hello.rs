#[cfg(test)]
mod test;

use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, oid::ObjectId, DateTime, Document},
    cmap::Connection,
    error::{Error, Result},
    options::ServerAddress,
    sdam::ServerType,
    selection_criteria::TagSet,
};

/// Construct the `hello` command sent by monitors and by the handshake of pooled connections.
///
/// `helloOk: true` is always included so that servers which only understand the legacy name keep
/// answering with the new response shape. `loadBalanced: true` is appended when connecting to a
/// load balancer.
pub(crate) fn hello_command(load_balanced: Option<bool>) -> Document {
    let mut command = doc! { "hello": 1, "helloOk": true };
    if load_balanced == Some(true) {
        command.insert("loadBalanced", true);
    }
    command
}

/// Execute a `hello` command on the given connection.
pub(crate) async fn run_hello(conn: &mut Connection, command: Document) -> Result<HelloReply> {
    let address = conn.address().clone();
    let response = conn.send_command(command).await?;
    HelloReply::parse(address, response)
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) raw_command_response: Document,
}

impl HelloReply {
    /// Parses a successful reply to `hello`. Host names are normalized to lowercase.
    pub(crate) fn parse(server_address: ServerAddress, reply: Document) -> Result<Self> {
        let mut command_response: HelloCommandResponse = crate::bson::from_document(reply.clone())
            .map_err(|e| Error::invalid_response(format!("invalid hello reply: {}", e)))?;
        command_response.normalize_hosts();

        Ok(Self {
            server_address,
            command_response,
            raw_command_response: reply,
        })
    }
}

/// The response to a `hello` command.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos instance, or a standalone mongod.
    pub is_writable_primary: Option<bool>,

    #[serde(rename = "ismaster")]
    /// Legacy name for `is_writable_primary` field.
    pub is_master: Option<bool>,

    pub hello_ok: Option<bool>,

    /// The list of all hosts.
    pub hosts: Option<Vec<String>>,

    /// The list of all passives in a replica set.
    pub passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub arbiters: Option<Vec<String>>,

    /// This contains the value "isdbgrid" when returned from a mongos.
    pub msg: Option<String>,

    /// The address of the server that returned this `HelloCommandResponse`.
    pub me: Option<String>,

    /// The current replica set config version.
    pub set_version: Option<i32>,

    /// The name of the current replica set.
    pub set_name: Option<String>,

    pub hidden: Option<bool>,

    pub secondary: Option<bool>,

    pub arbiter_only: Option<bool>,

    #[serde(rename = "isreplicaset")]
    pub is_replica_set: Option<bool>,

    /// Date information for the server's most recent write operation.
    pub last_write: Option<LastWrite>,

    pub min_wire_version: Option<i32>,

    pub max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub election_id: Option<ObjectId>,

    /// The address of current primary member of the replica set.
    pub primary: Option<String>,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub service_id: Option<ObjectId>,

    pub connection_id: Option<i64>,
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }

    fn normalize_hosts(&mut self) {
        for list in [&mut self.hosts, &mut self.passives, &mut self.arbiters]
            .into_iter()
            .flatten()
        {
            for host in list.iter_mut() {
                *host = host.to_lowercase();
            }
        }
        for host in [&mut self.me, &mut self.primary].into_iter().flatten() {
            *host = host.to_lowercase();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub last_write_date: DateTime,
}
