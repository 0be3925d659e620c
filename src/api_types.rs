//! Wire types for the standard beacon node HTTP API.
//!
//! Only the fields this indexer consumes are declared; serde skips the rest of each payload.

use crate::types::{Epoch, Hash256, Slot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::from_utf8;

/// `serde(with = ...)` helper for a `Vec<u8>` encoded as a `0x`-prefixed hex string.
///
/// `eth2_serde_utils` 0.1.0 (the version pinned in Cargo.toml) does not export a `hex_vec`
/// module, so this mirrors its behavior locally using the crate's own `hex` helpers.
mod hex_vec {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&eth2_serde_utils::hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(eth2_serde_utils::hex::PrefixedHexVisitor)
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Serialize + serde::de::DeserializeOwned")]
pub struct GenericResponse<T: Serialize + serde::de::DeserializeOwned> {
    pub data: T,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Serialize + serde::de::DeserializeOwned")]
pub struct DutiesResponse<T: Serialize + serde::de::DeserializeOwned> {
    pub dependent_root: Hash256,
    pub data: T,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ForkVersionedResponse<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub data: T,
}

/// Identifies a state on the remote node: `genesis`, a decimal slot number or a `0x`-prefixed
/// state root.
#[derive(Debug, Clone, PartialEq)]
pub enum StateId {
    Genesis,
    Slot(Slot),
    Root(Hash256),
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateId::Genesis => write!(f, "genesis"),
            StateId::Slot(slot) => write!(f, "{}", slot),
            StateId::Root(root) => write!(f, "{:?}", root),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: Hash256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalityCheckpointsData {
    pub previous_justified: Checkpoint,
    pub current_justified: Checkpoint,
    pub finalized: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisData {
    #[serde(with = "eth2_serde_utils::quoted_u64")]
    pub genesis_time: u64,
    pub genesis_validators_root: Hash256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposerData {
    #[serde(with = "eth2_serde_utils::quoted_u64")]
    pub validator_index: u64,
    pub slot: Slot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitteeData {
    #[serde(with = "eth2_serde_utils::quoted_u64")]
    pub index: u64,
    pub slot: Slot,
    #[serde(with = "eth2_serde_utils::quoted_u64_vec")]
    pub validators: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCommitteeData {
    #[serde(with = "eth2_serde_utils::quoted_u64_vec")]
    pub validators: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorData {
    #[serde(with = "eth2_serde_utils::quoted_u64")]
    pub index: u64,
    #[serde(with = "eth2_serde_utils::quoted_u64")]
    pub balance: u64,
    pub validator: ValidatorInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    #[serde(with = "eth2_serde_utils::quoted_u64")]
    pub effective_balance: u64,
    pub activation_epoch: Epoch,
    pub exit_epoch: Epoch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconBlockHeader {
    pub slot: Slot,
    #[serde(with = "eth2_serde_utils::quoted_u64")]
    pub proposer_index: u64,
    pub parent_root: Hash256,
    pub state_root: Hash256,
    pub body_root: Hash256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeaderAndSignature {
    pub message: BeaconBlockHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeaderData {
    pub root: Hash256,
    pub canonical: bool,
    pub header: BlockHeaderAndSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationData {
    pub slot: Slot,
    #[serde(with = "eth2_serde_utils::quoted_u64")]
    pub index: u64,
    pub beacon_block_root: Hash256,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    #[serde(with = "hex_vec")]
    pub aggregation_bits: Vec<u8>,
    pub data: AttestationData,
}

impl Attestation {
    /// Whether bit `index` of the aggregation bitfield is set. Bits are packed LSB-first per
    /// byte, following the SSZ bitlist layout.
    pub fn has_aggregation_bit(&self, index: usize) -> bool {
        self.aggregation_bits
            .get(index / 8)
            .map_or(false, |byte| byte & (1 << (index % 8)) != 0)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BeaconBlockBody {
    #[serde(default)]
    pub attestations: Vec<Attestation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconBlock {
    pub slot: Slot,
    #[serde(with = "eth2_serde_utils::quoted_u64")]
    pub proposer_index: u64,
    pub parent_root: Hash256,
    pub state_root: Hash256,
    pub body: BeaconBlockBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedBeaconBlock {
    pub message: BeaconBlock,
}

// --------- Server Sent Event Types -----------

#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct SseHead {
    pub slot: Slot,
    pub block: Hash256,
    pub state: Hash256,
    pub current_duty_dependent_root: Hash256,
    pub previous_duty_dependent_root: Hash256,
    pub epoch_transition: bool,
}

impl SseHead {
    /// Parse one `text/event-stream` message of the form `event:head\ndata:{..}`.
    ///
    /// Returns `Ok(None)` for event tags other than `head` (keep-alives, unknown topics).
    pub fn from_sse_bytes(message: &[u8]) -> Result<Option<Self>, String> {
        let s = from_utf8(message).map_err(|e| format!("{:?}", e))?;

        let mut split = s.split('\n');
        let event = split
            .next()
            .ok_or_else(|| "Could not parse event tag".to_string())?
            .trim_start_matches("event:")
            .trim();
        if event != "head" {
            return Ok(None);
        }
        let data = split
            .next()
            .ok_or_else(|| "Could not parse data tag".to_string())?
            .trim_start_matches("data:");

        serde_json::from_str(data)
            .map(Some)
            .map_err(|e| format!("Head: {:?}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregation_bits_indexing() {
        let att = Attestation {
            aggregation_bits: vec![0b0000_0101, 0b1000_0000],
            data: AttestationData {
                slot: Slot::new(0),
                index: 0,
                beacon_block_root: Hash256::zero(),
                source: Checkpoint {
                    epoch: Epoch::new(0),
                    root: Hash256::zero(),
                },
                target: Checkpoint {
                    epoch: Epoch::new(0),
                    root: Hash256::zero(),
                },
            },
        };
        assert!(att.has_aggregation_bit(0));
        assert!(!att.has_aggregation_bit(1));
        assert!(att.has_aggregation_bit(2));
        assert!(att.has_aggregation_bit(15));
        assert!(!att.has_aggregation_bit(16));
    }

    #[test]
    fn state_id_rendering() {
        assert_eq!(StateId::Genesis.to_string(), "genesis");
        assert_eq!(StateId::Slot(Slot::new(64)).to_string(), "64");
        let root = StateId::Root(Hash256::repeat_byte(0xab)).to_string();
        assert!(root.starts_with("0x"));
        assert_eq!(root.len(), 66);
    }

    #[test]
    fn head_event_parsing() {
        let msg = b"event:head\ndata:{\"slot\":\"10\",\"block\":\"0xdf16838a0c8acd26b934057ac6b4771b036e69f9a2fee7b5715de5eeb57c5b82\",\"state\":\"0x600e852a08c1200654ddf11025f1ceacb3c2ae1e4e7a51bf1c017ebebb3832cf\",\"current_duty_dependent_root\":\"0x5e0043f107cb57913498fbf2f99ff55e730bf1e151f02f221e977c91a90a0e91\",\"previous_duty_dependent_root\":\"0x5e0043f107cb57913498fbf2f99ff55e730bf1e151f02f221e977c91a90a0e91\",\"epoch_transition\":false}";
        let head = SseHead::from_sse_bytes(msg).unwrap().unwrap();
        assert_eq!(head.slot, Slot::new(10));
        assert!(!head.epoch_transition);

        let other = b"event:finalized_checkpoint\ndata:{}";
        assert_eq!(SseHead::from_sse_bytes(other).unwrap(), None);
    }
}
