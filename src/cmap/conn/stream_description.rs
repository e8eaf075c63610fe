use crate::{
    bson::oid::ObjectId,
    hello::HelloReply,
    options::ServerAddress,
    sdam::ServerType,
};

/// Contains information about a given server in a format digestible by a connection.
#[derive(Debug, Default, Clone)]
pub struct StreamDescription {
    /// The address of the server.
    pub(crate) server_address: ServerAddress,

    /// The type of the server when the handshake occurred.
    pub(crate) initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// The minimum wire version that the server understands.
    pub(crate) min_wire_version: Option<i32>,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub(crate) service_id: Option<ObjectId>,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a `HelloReply`.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: reply.command_response.server_type(),
            max_wire_version: reply.command_response.max_wire_version,
            min_wire_version: reply.command_response.min_wire_version,
            service_id: reply.command_response.service_id,
        }
    }

    /// The address of the server the handshake was performed with.
    pub fn server_address(&self) -> &ServerAddress {
        &self.server_address
    }

    /// The type the server reported during the handshake.
    pub fn initial_server_type(&self) -> ServerType {
        self.initial_server_type
    }

    pub fn max_wire_version(&self) -> Option<i32> {
        self.max_wire_version
    }

    pub fn min_wire_version(&self) -> Option<i32> {
        self.min_wire_version
    }

    /// The id of the backend selected by a load balancer, if the connection goes through one.
    pub fn service_id(&self) -> Option<ObjectId> {
        self.service_id
    }
}
