//! Call metadata
//!
//! Parameters accompanying every service call. The host never inspects
//! them; they travel verbatim to the control runtime, which exposes them to
//! guest code through the `host.get_call_parameters` import.

use serde::{Deserialize, Serialize};

/// Parameters of the particle that caused a call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleParameters {
    /// Id of the particle whose execution resulted in this call.
    pub id: String,
    /// Peer id of the script initiator.
    pub init_peer_id: String,
    /// Unix timestamp of the particle start time, in milliseconds.
    pub timestamp: u64,
    /// Time to live for this particle, in milliseconds.
    pub ttl: u32,
    /// Script carried by this particle.
    pub script: String,
    /// Signature made by the particle initiator.
    pub signature: Vec<u8>,
    /// Particle signature countersigned by the host.
    pub token: String,
}

/// Provenance of a single call argument.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityTetraplet {
    /// Peer on which the value was set.
    pub peer_pk: String,
    /// Service that produced the value.
    pub service_id: String,
    /// Function that produced the value.
    pub function_name: String,
    /// Path applied to the function output to obtain the value.
    pub lens: String,
}

impl SecurityTetraplet {
    pub fn new(
        peer_pk: impl Into<String>,
        service_id: impl Into<String>,
        function_name: impl Into<String>,
        lens: impl Into<String>,
    ) -> Self {
        Self {
            peer_pk: peer_pk.into(),
            service_id: service_id.into(),
            function_name: function_name.into(),
            lens: lens.into(),
        }
    }
}

/// Metadata of one call. `Default` is the neutral value substituted when a
/// caller omits call parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallParameters {
    pub particle: ParticleParameters,
    /// Id of the service being called.
    pub service_id: String,
    /// Peer that created the service.
    pub service_creator_peer_id: String,
    /// Peer hosting the service.
    pub host_id: String,
    /// Worker hosting the service.
    pub worker_id: String,
    /// One inner list per call argument.
    pub tetraplets: Vec<Vec<SecurityTetraplet>>,
}

impl CallParameters {
    pub fn to_json_string(&self) -> String {
        // Only strings, integers and lists: serialization is infallible.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
