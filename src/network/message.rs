use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blockchain::Block;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("network id mismatch: expected {expected}, got {got}")]
    NetworkMismatch { expected: String, got: String },
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },
    #[error("handshake required before {0}")]
    HandshakeRequired(&'static str),
}

/// Kinds of objects an INV can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvType {
    Block,
}

/// One line on the wire: `{"type":"HELLO","nodeId":...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    Hello {
        node_id: String,
        network_id: String,
        protocol_version: u32,
        #[serde(default)]
        listen_addr: Option<String>,
    },
    Ping {
        ts: i64,
    },
    Pong {
        ts: i64,
    },
    Peers {
        peers: Vec<String>,
    },
    ChainSummary {
        height: u64,
        tip_hash: String,
    },
    Inv {
        obj_type: InvType,
        hashes: Vec<String>,
    },
    GetBlocks {
        from_height: u64,
        max: u32,
    },
    Block {
        block: Box<Block>,
    },
    Error {
        message: String,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::Ping { .. } => "PING",
            Message::Pong { .. } => "PONG",
            Message::Peers { .. } => "PEERS",
            Message::ChainSummary { .. } => "CHAIN_SUMMARY",
            Message::Inv { .. } => "INV",
            Message::GetBlocks { .. } => "GET_BLOCKS",
            Message::Block { .. } => "BLOCK",
            Message::Error { .. } => "ERROR",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_is_type_tagged_camel_case() {
        let msg = Message::Hello {
            node_id: "n1".into(),
            network_id: "net".into(),
            protocol_version: 1,
            listen_addr: Some("127.0.0.1:6001".into()),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "HELLO");
        assert_eq!(value["nodeId"], "n1");
        assert_eq!(value["protocolVersion"], 1);

        let get = Message::GetBlocks {
            from_height: 3,
            max: 10,
        };
        let value: serde_json::Value = serde_json::from_str(&get.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "GET_BLOCKS");
        assert_eq!(value["fromHeight"], 3);
    }

    #[test]
    fn decodes_hand_written_lines() {
        let msg = Message::decode(r#"{"type":"CHAIN_SUMMARY","height":4,"tipHash":"ab"}"#).unwrap();
        assert_eq!(
            msg,
            Message::ChainSummary {
                height: 4,
                tip_hash: "ab".into()
            }
        );
        let inv = Message::decode(r#"{"type":"INV","objType":"block","hashes":["x"]}"#).unwrap();
        assert_eq!(inv.kind(), "INV");
        // listen address is optional
        let hello = Message::decode(
            r#"{"type":"HELLO","nodeId":"a","networkId":"b","protocolVersion":1}"#,
        )
        .unwrap();
        assert!(matches!(hello, Message::Hello { listen_addr: None, .. }));
    }

    #[test]
    fn block_envelope_keeps_hash() {
        let genesis = Block::genesis();
        let line = Message::Block {
            block: Box::new(genesis.clone()),
        }
        .encode()
        .unwrap();
        match Message::decode(&line).unwrap() {
            Message::Block { block } => assert_eq!(block.calculate_hash(), genesis.hash),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_lines_are_typed_errors() {
        assert!(matches!(Message::decode("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            Message::decode(r#"{"type":"TELEPORT"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Message::decode(r#"{"type":"PING"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
