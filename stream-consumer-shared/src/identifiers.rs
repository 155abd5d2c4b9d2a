//! Identifier derivation: content digests, event coordinates and message
//! identity.
//!
//! Everything here is pure with respect to the batch — the actual user
//! callbacks live behind the traits in [`crate::callbacks`] and are invoked
//! by [`crate::batch::Batch::add_message`], which stitches the three steps
//! (digests, coordinates, identity) together and decides where a failure
//! routes the item.

use std::collections::BTreeMap;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// An ordered list of named properties extracted from a message, e.g. the
/// configured `idPropertyNames` projected onto a concrete message.
pub type PropertyList = Vec<(String, Value)>;

/// Content digests of the message, the record, the user record and the raw
/// record data, each optional because not every input is always present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digests {
    pub msg: Option<String>,
    pub rec: Option<String>,
    pub user_rec: Option<String>,
    pub data: Option<String>,
}

/// Coordinates that locate a record within its origin stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCoordinates {
    pub event_id: String,
    pub event_seq_no: String,
    pub event_sub_seq_no: Option<String>,
}

/// The resolved identity of a message: its id/key/seq-no projections plus
/// the joined string forms used for logging and checkpoint matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageIdentity {
    pub ids: PropertyList,
    pub keys: PropertyList,
    pub seq_nos: PropertyList,
    pub id: String,
    pub key: String,
    pub seq_no: String,
    pub description: String,
}

const PAIR_DELIM: &str = ":";
const LIST_DELIM: &str = "|";

/// Canonicalises a JSON value by sorting object keys recursively, so two
/// structurally-equal documents with different field order digest the same.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A stable content digest of a JSON value's canonical encoding.
pub fn digest_of(value: &Value) -> Result<String> {
    let canon = canonicalize(value);
    let bytes = serde_json::to_vec(&canon)?;
    let mut hasher = Md5::new();
    hasher.update(&bytes);
    Ok(hex_encode(&hasher.finalize()))
}

/// Derives the four content digests for a message/record/user-record
/// triple. Any of the inputs may be absent; their digest is then `None`.
pub fn derive_digests(
    message: Option<&Value>,
    record: Option<&Value>,
    user_record: Option<&Value>,
) -> Result<Digests> {
    Ok(Digests {
        msg: message.map(digest_of).transpose()?,
        rec: record.map(digest_of).transpose()?,
        user_rec: user_record.map(digest_of).transpose()?,
        data: record
            .and_then(|r| r.get("data"))
            .map(digest_of)
            .transpose()?,
    })
}

fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Joins a property list into the `name:value|name:value` form used for
/// logging and for the checkpoint "big fat key" fallback.
pub fn join_property_list(list: &PropertyList) -> String {
    list.iter()
        .map(|(name, value)| format!("{name}{PAIR_DELIM}{}", value_to_plain_string(value)))
        .collect::<Vec<_>>()
        .join(LIST_DELIM)
}

/// Projects a list of property names out of a JSON object, skipping any
/// name the object does not contain.
pub fn project_properties(message: &Value, names: &[String]) -> PropertyList {
    let Some(obj) = message.as_object() else {
        return Vec::new();
    };
    names
        .iter()
        .filter_map(|name| obj.get(name).map(|v| (name.clone(), v.clone())))
        .collect()
}

/// The fallback identity policy applied when the caller configures no
/// explicit id/key/seq-no property names: seq-nos default to the event's
/// own sequence number, keys stay empty, and ids become keys plus seq-nos.
pub fn resolve_message_identity(
    message: &Value,
    coords: &EventCoordinates,
    id_names: &[String],
    key_names: &[String],
    seq_no_names: &[String],
) -> MessageIdentity {
    let keys = project_properties(message, key_names);
    let seq_nos = if seq_no_names.is_empty() {
        vec![("eventSeqNo".to_string(), Value::String(coords.event_seq_no.clone()))]
    } else {
        project_properties(message, seq_no_names)
    };
    let ids = if id_names.is_empty() {
        let mut combined = keys.clone();
        combined.extend(seq_nos.clone());
        combined
    } else {
        project_properties(message, id_names)
    };

    let id = join_property_list(&ids);
    let key = join_property_list(&keys);
    let seq_no = join_property_list(&seq_nos);
    let description = format!(
        "message[id={id}, key={}, seqNo={}, event={}/{}]",
        if key.is_empty() { "<none>" } else { &key },
        if seq_no.is_empty() { "<none>" } else { &seq_no },
        coords.event_id,
        coords.event_seq_no,
    );

    MessageIdentity {
        ids,
        keys,
        seq_nos,
        id,
        key,
        seq_no,
        description,
    }
}

/// Resolves event coordinates from a record's well-known `eventId` /
/// `eventSeqNo` / `eventSubSeqNo` fields. Hosts with a different record
/// shape supply their own [`crate::callbacks::EventCoordinateResolver`]
/// instead of this default.
pub fn resolve_event_coordinates_default(record: &Value) -> Result<EventCoordinates> {
    let event_id = record
        .get("eventId")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::unusable("record missing eventId"))?
        .to_string();
    let event_seq_no = record
        .get("eventSeqNo")
        .map(value_to_plain_string)
        .ok_or_else(|| CoreError::unusable("record missing eventSeqNo"))?;
    let event_sub_seq_no = record.get("eventSubSeqNo").map(value_to_plain_string);
    Ok(EventCoordinates {
        event_id,
        event_seq_no,
        event_sub_seq_no,
    })
}
