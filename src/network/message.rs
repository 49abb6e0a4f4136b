use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvType {
    Block,
    Tx,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvItem {
    #[serde(rename = "type")]
    pub kind: InvType,
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
}

impl InvItem {
    pub fn block(hash: &[u8]) -> InvItem {
        InvItem {
            kind: InvType::Block,
            hash: hash.to_vec(),
        }
    }

    pub fn tx(hash: &[u8]) -> InvItem {
        InvItem {
            kind: InvType::Tx,
            hash: hash.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPayload {
    pub protocol_version: u32,
    pub agent: String,
    pub height: u64,
    pub capabilities: Vec<String>,
    pub timestamp: i64,
}

/// Every protocol message, framed on the wire as
/// `{"type": "<tag>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Message {
    Version(VersionPayload),
    Verack {},
    /// The locator is accepted but not used: the reply lists every block.
    GetBlocks {
        #[serde(with = "hex_list")]
        locator_hashes: Vec<Vec<u8>>,
        #[serde(with = "hex_bytes")]
        stop_hash: Vec<u8>,
    },
    Inv {
        items: Vec<InvItem>,
    },
    GetData {
        items: Vec<InvItem>,
    },
    /// bincode-encoded block
    Block {
        #[serde(with = "hex_bytes")]
        block: Vec<u8>,
    },
    /// bincode-encoded transaction
    Tx {
        #[serde(with = "hex_bytes")]
        transaction: Vec<u8>,
    },
    GetMempool {},
    Mempool {
        #[serde(with = "hex_list")]
        hashes: Vec<Vec<u8>>,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack {} => "verack",
            Message::GetBlocks { .. } => "getblocks",
            Message::Inv { .. } => "inv",
            Message::GetData { .. } => "getdata",
            Message::Block { .. } => "block",
            Message::Tx { .. } => "tx",
            Message::GetMempool {} => "getmempool",
            Message::Mempool { .. } => "mempool",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
        }
    }

    /// Messages a connection answers before its handshake completes.
    pub fn is_handshake_or_liveness(&self) -> bool {
        matches!(
            self,
            Message::Version(_) | Message::Verack {} | Message::Ping { .. } | Message::Pong { .. }
        )
    }
}

// Byte strings travel as lowercase hex.
mod hex_bytes {
    use data_encoding::HEXLOWER;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&HEXLOWER.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        HEXLOWER
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod hex_list {
    use data_encoding::HEXLOWER;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(list: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(list.len()))?;
        for bytes in list {
            seq.serialize_element(&HEXLOWER.encode(bytes))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|text| {
                HEXLOWER
                    .decode(text.as_bytes())
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let message = Message::Inv {
            items: vec![InvItem::block(&[0xab, 0xcd])],
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({"type": "inv", "payload": {"items": [{"type": "block", "hash": "abcd"}]}})
        );
    }

    #[test]
    fn test_empty_payload_tags() {
        let value = serde_json::to_value(Message::GetMempool {}).unwrap();
        assert_eq!(value["type"], "getmempool");
        let value = serde_json::to_value(Message::Verack {}).unwrap();
        assert_eq!(value["type"], "verack");
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let raw = r#"{"type": "addr", "payload": {}}"#;
        assert!(serde_json::from_str::<Message>(raw).is_err());
    }

    #[test]
    fn test_bad_hex_is_rejected() {
        let raw = r#"{"type": "block", "payload": {"block": "zz"}}"#;
        assert!(serde_json::from_str::<Message>(raw).is_err());
    }

    #[test]
    fn test_handshake_gate() {
        assert!(Message::Ping { nonce: 1 }.is_handshake_or_liveness());
        assert!(!Message::GetMempool {}.is_handshake_or_liveness());
        assert_eq!(
            Message::GetBlocks {
                locator_hashes: vec![],
                stop_hash: vec![]
            }
            .kind(),
            "getblocks"
        );
    }
}
