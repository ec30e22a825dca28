use crate::config::{Destination, Source};
use crate::destination::DestinationKind;
use serde::{Deserialize, Serialize};

/// A live (source, destination) pair the scheduler routes uploads for,
/// with its derived namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub workspace_id: String,
    pub source: Source,
    pub destination: Destination,
    pub namespace: String,
    pub destination_kind: DestinationKind,
    /// `KIND:sourceId:destinationId`, the key of trigger flags and
    /// last-processed markers.
    pub identifier: String,
}

impl Connection {
    pub fn new(
        workspace_id: String,
        source: Source,
        destination: Destination,
        namespace: String,
        destination_kind: DestinationKind,
    ) -> Self {
        let identifier = connection_identifier(destination_kind, &source.id, &destination.id);
        Self {
            workspace_id,
            source,
            destination,
            namespace,
            destination_kind,
            identifier,
        }
    }

    /// Name of the worker pool this connection's jobs are delivered to.
    /// One pool per `destinationId_namespace`, or per
    /// `sourceId_destinationId_namespace` when multiple sources may be picked
    /// up independently.
    pub fn worker_identifier(&self, multi_source: bool) -> String {
        if multi_source {
            format!(
                "{}_{}_{}",
                self.source.id, self.destination.id, self.namespace
            )
        } else {
            format!("{}_{}", self.destination.id, self.namespace)
        }
    }

    /// Per-connection sync frequency override, in minutes.
    pub fn sync_frequency_mins(&self) -> Option<i64> {
        self.destination
            .config_str("syncFrequency")
            .and_then(|raw| raw.parse().ok())
    }
}

pub fn connection_identifier(kind: DestinationKind, source_id: &str, dest_id: &str) -> String {
    format!("{}:{}:{}", kind.as_str(), source_id, dest_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Destination, Source};

    fn connection() -> Connection {
        let mut destination = Destination {
            id: "dst-9".into(),
            name: "pg".into(),
            enabled: true,
            ..Default::default()
        };
        destination.config.insert(
            "syncFrequency".into(),
            serde_json::Value::String("30".into()),
        );
        Connection::new(
            "ws-1".into(),
            Source {
                id: "src-4".into(),
                name: "app".into(),
                enabled: true,
                ..Default::default()
            },
            destination,
            "app_events".into(),
            DestinationKind::Postgres,
        )
    }

    #[test]
    fn identifier_includes_kind_and_pair() {
        assert_eq!(connection().identifier, "POSTGRES:src-4:dst-9");
    }

    #[test]
    fn worker_identifier_depends_on_pickup_mode() {
        let conn = connection();
        assert_eq!(conn.worker_identifier(false), "dst-9_app_events");
        assert_eq!(conn.worker_identifier(true), "src-4_dst-9_app_events");
    }

    #[test]
    fn sync_frequency_parses_minutes() {
        assert_eq!(connection().sync_frequency_mins(), Some(30));
    }
}
