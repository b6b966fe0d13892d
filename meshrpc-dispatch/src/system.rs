//! System command argument schemas (§4.8). Every system command is R+R on
//! the reliable system channel regardless of the channel class its target
//! command normally uses; this module only carries the typed request/
//! response shapes, the dispatching logic lives in [`crate::dispatcher`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use meshrpc_core::codec::{decode_params_default, encode_params};
use meshrpc_core::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatArgs {
    pub uuid: Uuid,
}

// `configuration`/`port` are plain `Option` fields with no
// `skip_serializing_if`: the positional codec (`meshrpc_core::codec`) zips
// `params` back up against a field-name list derived from `Self::default()`,
// so every instance of this type must serialize the same number of fields
// regardless of which are `None` — a conditionally-omitted field would
// shift positions and make `decode_params` reject a present `None` as a
// length mismatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeArgs {
    pub command_name: String,
    #[serde(default)]
    pub configuration: Option<Value>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandListArgs {
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityArgs {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityResponse {
    pub capabilities: Vec<String>,
}

pub fn encode_heartbeat(uuid: Uuid) -> Result<Vec<Value>> {
    encode_params(&HeartbeatArgs { uuid })
}

pub fn decode_heartbeat(params: &[Value]) -> Result<HeartbeatArgs> {
    decode_params_default(params)
}

pub fn encode_subscribe(command_name: impl Into<String>, configuration: Option<Value>, port: Option<u16>) -> Result<Vec<Value>> {
    encode_params(&SubscribeArgs {
        command_name: command_name.into(),
        configuration,
        port,
    })
}

pub fn decode_subscribe(params: &[Value]) -> Result<SubscribeArgs> {
    decode_params_default(params)
}

pub fn encode_command_list(commands: Vec<String>) -> Result<Vec<Value>> {
    encode_params(&CommandListArgs { commands })
}

pub fn decode_command_list(params: &[Value]) -> Result<CommandListArgs> {
    decode_params_default(params)
}

pub fn decode_capability_response(value: Value) -> Result<CapabilityResponse> {
    Ok(serde_json::from_value(value)?)
}

pub fn encode_capability_response(capabilities: Vec<String>) -> Result<Value> {
    Ok(serde_json::to_value(CapabilityResponse { capabilities })?)
}
