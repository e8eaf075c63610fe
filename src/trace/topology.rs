use crate::{
    bson::{oid::ObjectId, Bson, Document},
    event::sdam::SdamEvent,
};

use super::{TracingRepresentation, TOPOLOGY_TRACING_EVENT_TARGET};

/// Replies longer than this are truncated in heartbeat log lines.
const MAX_REPLY_LENGTH_BYTES: usize = 1000;

fn reply_representation(reply: Document) -> String {
    let mut json = Bson::Document(reply).into_relaxed_extjson().to_string();
    if json.len() > MAX_REPLY_LENGTH_BYTES {
        let mut end = MAX_REPLY_LENGTH_BYTES;
        while !json.is_char_boundary(end) {
            end -= 1;
        }
        json.truncate(end);
        json.push_str("...");
    }
    json
}

#[derive(Clone)]
pub(crate) struct TopologyTracingEventEmitter {
    topology_id: ObjectId,
}

impl TopologyTracingEventEmitter {
    pub(crate) fn new(topology_id: ObjectId) -> TopologyTracingEventEmitter {
        TopologyTracingEventEmitter { topology_id }
    }

    pub(crate) fn handle(&self, event: SdamEvent) {
        use SdamEvent::*;
        match event {
            // Covered by the topology description change logged alongside it.
            ServerDescriptionChanged(_) => {}
            ServerOpening(event) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    "Starting server monitoring"
                )
            }
            ServerClosed(event) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    "Stopped server monitoring"
                )
            }
            TopologyDescriptionChanged(event) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    previousDescription = event.previous_description.tracing_representation(),
                    newDescription = event.new_description.tracing_representation(),
                    "Topology description changed"
                )
            }
            TopologyOpening(_) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    "Starting topology monitoring"
                )
            }
            TopologyClosed(_) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    "Stopped topology monitoring"
                )
            }
            ServerHeartbeatStarted(event) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.server_address.host(),
                    serverPort = event.server_address.port_tracing_representation(),
                    "Server heartbeat started"
                )
            }
            ServerHeartbeatSucceeded(event) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.server_address.host(),
                    serverPort = event.server_address.port_tracing_representation(),
                    reply = reply_representation(event.reply),
                    durationMS = event.duration.as_millis(),
                    "Server heartbeat succeeded"
                )
            }
            ServerHeartbeatFailed(event) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.server_address.host(),
                    serverPort = event.server_address.port_tracing_representation(),
                    failure = event.failure.tracing_representation(),
                    durationMS = event.duration.as_millis(),
                    "Server heartbeat failed"
                )
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::bson::doc;

    #[test]
    fn long_replies_are_truncated() {
        let reply = doc! { "hosts": vec!["a".repeat(2000)] };
        let representation = super::reply_representation(reply);
        assert!(representation.ends_with("..."));
        assert_eq!(representation.len(), super::MAX_REPLY_LENGTH_BYTES + 3);

        let short = super::reply_representation(doc! { "ok": 1 });
        assert!(!short.ends_with("..."));
    }
}
