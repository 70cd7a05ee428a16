//! Wire messages and generated gRPC stubs for `keel.sync.AgentSync`.
//!
//! Payloads travel as JSON inside an [`Envelope`], the same way cluster
//! consensus messages carry serialized state in opaque byte fields.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Agent metadata header carrying its region.
pub const REGION_HEADER: &str = "x-keel-region";
/// Agent metadata header carrying its shard.
pub const SHARD_HEADER: &str = "x-keel-shard";

#[derive(Clone, PartialEq, prost::Message)]
pub struct WatchRequest {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(btree_map = "string, string", tag = "2")]
    pub selectors: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn from_json<T: Serialize>(value: &T) -> SyncResult<Self> {
        let data = serde_json::to_vec(value).map_err(|e| SyncError::Codec(e.to_string()))?;
        Ok(Self { data })
    }

    pub fn to_value<T: DeserializeOwned>(&self) -> SyncResult<T> {
        serde_json::from_slice(&self.data).map_err(|e| SyncError::Codec(e.to_string()))
    }

    /// Acknowledgement with no payload.
    pub fn empty() -> Self {
        Self { data: Vec::new() }
    }
}

/// Body of the unary desired-state lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadLookup {
    pub id: String,
}

include!(concat!(env!("OUT_DIR"), "/keel.sync.AgentSync.rs"));

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn envelope_carries_json() {
        let env = Envelope::from_json(&WorkloadLookup { id: "d-1".into() }).unwrap();
        let bytes = env.encode_to_vec();
        let decoded = Envelope::decode(bytes.as_slice()).unwrap();
        let lookup: WorkloadLookup = decoded.to_value().unwrap();
        assert_eq!(lookup.id, "d-1");
    }

    #[test]
    fn garbage_payload_is_codec_error() {
        let env = Envelope {
            data: b"not json".to_vec(),
        };
        assert!(matches!(
            env.to_value::<WorkloadLookup>(),
            Err(SyncError::Codec(_))
        ));
    }
}
