//! Argument codec: translates a `Serialize`/`Deserialize` argument struct to
//! and from the envelope's positional `params` array.
//!
//! The alphabetical-ordering law ("two arg-objects with identical field
//! values produce identical `params` arrays regardless of construction
//! order") is implemented generically rather than per-type: any argument
//! struct serializes to a `serde_json::Value::Object`, which we re-key
//! through a `BTreeMap<String, Value>` (sorted by construction) before
//! taking just the values. Decoding walks the same field-name list to
//! rebuild a `Value::Object` that `serde_json` can deserialize back into
//! the original type. The field-name list (and so the `params` array's
//! width) must be the same for every instance of a given type, so a field
//! can only opt out of serialization with `#[serde(skip)]` (omitted from
//! both sides, always). `#[serde(skip_serializing_if = ...)]` is NOT safe
//! here: it drops the field only when the condition holds, which shifts
//! every later position and makes `decode_params`'s length check reject the
//! encoding of a present value of that same field. Use a plain `Option`
//! field (serializing to `Value::Null` when absent) instead.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Encode an argument struct into its alphabetically-ordered `params` array.
pub fn encode_params<T: Serialize>(args: &T) -> Result<Vec<Value>> {
    let value = serde_json::to_value(args)?;
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map.into_iter().collect();
            Ok(sorted.into_values().collect())
        }
        Value::Null => Ok(Vec::new()),
        other => Err(Error::DecodeFailed(format!(
            "argument struct must serialize to an object, got {other}"
        ))),
    }
}

/// Return the field names (in the alphabetical order used on the wire) of an
/// already-serialized argument value. Used by the decode side to know which
/// position in `params` corresponds to which field.
fn field_names(template: &Value) -> Result<Vec<String>> {
    match template {
        Value::Object(map) => {
            let mut names: Vec<String> = map.keys().cloned().collect();
            names.sort();
            Ok(names)
        }
        _ => Err(Error::DecodeFailed("expected object template".into())),
    }
}

/// Decode a `params` array back into an argument struct, given a same-typed
/// `template` value (typically `T::default()` serialized, or any prior
/// instance) that supplies the field-name list to re-key against.
pub fn decode_params<T: DeserializeOwned>(params: &[Value], template: &Value) -> Result<T> {
    let names = field_names(template)?;
    if names.len() != params.len() {
        return Err(Error::DecodeFailed(format!(
            "expected {} params, got {}",
            names.len(),
            params.len()
        )));
    }
    let mut map = serde_json::Map::new();
    for (name, value) in names.into_iter().zip(params.iter().cloned()) {
        map.insert(name, value);
    }
    Ok(serde_json::from_value(Value::Object(map))?)
}

/// Convenience for argument types that implement `Default`: builds the
/// decode template automatically.
pub fn decode_params_default<T>(params: &[Value]) -> Result<T>
where
    T: DeserializeOwned + Serialize + Default,
{
    let template = serde_json::to_value(T::default())?;
    decode_params(params, &template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct KeyValueArgs {
        value: String,
        key: String,
    }

    #[test]
    fn alphabetical_ordering_is_construction_order_independent() {
        let a = KeyValueArgs {
            key: "k".into(),
            value: "v".into(),
        };
        let b = KeyValueArgs {
            value: "v".into(),
            key: "k".into(),
        };
        assert_eq!(encode_params(&a).unwrap(), encode_params(&b).unwrap());
        // `key` sorts before `value`.
        let params = encode_params(&a).unwrap();
        assert_eq!(params[0], Value::String("k".into()));
        assert_eq!(params[1], Value::String("v".into()));
    }

    #[test]
    fn roundtrip_law() {
        let original = KeyValueArgs {
            key: "answer".into(),
            value: "42".into(),
        };
        let params = encode_params(&original).unwrap();
        let decoded: KeyValueArgs = decode_params_default(&params).unwrap();
        assert_eq!(decoded, original);
    }
}
