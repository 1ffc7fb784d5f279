use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::cdcrelay::record::ChangeRecord;
use crate::cdcrelay::types::TableName;

/// Identifies one UI surface attached to the client installation
pub type SurfaceId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Surface -> router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SurfaceRequest {
    SubscribeCdc { tables: Vec<TableName> },
    UnsubscribeCdc { tables: Vec<TableName> },
    GetState,
}

/// Router -> surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SurfaceMessage {
    CdcBatch {
        table: TableName,
        records: Vec<ChangeRecord>,
    },
    ConnectionStatus {
        status: ConnectionStatus,
    },
    StateSnapshot {
        status: ConnectionStatus,
        tables: BTreeMap<TableName, Vec<Map<String, Value>>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_use_screaming_tags() {
        let req: SurfaceRequest = serde_json::from_value(json!({
            "type": "SUBSCRIBE_CDC",
            "tables": ["trades"]
        }))
        .unwrap();
        assert_eq!(req, SurfaceRequest::SubscribeCdc { tables: vec!["trades".to_string()] });

        let req: SurfaceRequest = serde_json::from_value(json!({"type": "GET_STATE"})).unwrap();
        assert_eq!(req, SurfaceRequest::GetState);
    }

    #[test]
    fn status_message_shape() {
        let msg = SurfaceMessage::ConnectionStatus { status: ConnectionStatus::Connected };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "CONNECTION_STATUS", "status": "connected"})
        );
    }
}
