//! User-supplied callback traits: the seams where host code plugs domain
//! logic into the batch lifecycle engine. Each trait is object-safe so a
//! host can configure the engine with `Arc<dyn Trait>` implementations.

use serde_json::Value;

use crate::config::ConsumerConfig;
use crate::error::Result;
use crate::identifiers::{
    self, Digests, EventCoordinates, MessageIdentity, PropertyList,
};

/// Splits a raw record into zero or more messages (`extractMessagesFromRecord`).
pub trait MessageExtractor: Send + Sync {
    fn extract_messages(&self, record: &Value) -> Result<Vec<Value>>;
}

/// Extracts a single message from a record (`extractMessageFromRecord`),
/// the common case when a record carries exactly one message.
pub trait SingleMessageExtractor: Send + Sync {
    fn extract_message(&self, record: &Value) -> Result<Option<Value>>;
}

/// Generates content digests for a message/record/user-record triple
/// (`generateMD5s`). Fails only if the callback itself fails; that failure
/// is surfaced as fatal.
pub trait DigestGenerator: Send + Sync {
    fn generate(
        &self,
        message: Option<&Value>,
        record: Option<&Value>,
        user_record: Option<&Value>,
    ) -> Result<Digests>;
}

/// Resolves a record's event coordinates (`resolveEventIdAndSeqNos`).
pub trait EventCoordinateResolver: Send + Sync {
    fn resolve(&self, record: &Value, user_record: Option<&Value>) -> Result<EventCoordinates>;
}

/// Resolves a message's id/key/seq-no projections
/// (`resolveMessageIdsAndSeqNos`).
pub trait MessageIdentityResolver: Send + Sync {
    fn resolve(
        &self,
        message: &Value,
        record: &Value,
        user_record: Option<&Value>,
        coords: &EventCoordinates,
        digests: &Digests,
    ) -> Result<(PropertyList, PropertyList, PropertyList)>;
}

/// The default [`DigestGenerator`]: stable content digests of the
/// canonical JSON encoding of each present input.
#[derive(Debug, Default)]
pub struct DefaultDigestGenerator;

impl DigestGenerator for DefaultDigestGenerator {
    fn generate(
        &self,
        message: Option<&Value>,
        record: Option<&Value>,
        user_record: Option<&Value>,
    ) -> Result<Digests> {
        identifiers::derive_digests(message, record, user_record)
    }
}

/// The default [`EventCoordinateResolver`]: reads `eventId` / `eventSeqNo`
/// / `eventSubSeqNo` off the record.
#[derive(Debug, Default)]
pub struct DefaultEventCoordinateResolver;

impl EventCoordinateResolver for DefaultEventCoordinateResolver {
    fn resolve(&self, record: &Value, _user_record: Option<&Value>) -> Result<EventCoordinates> {
        identifiers::resolve_event_coordinates_default(record)
    }
}

/// The default [`MessageIdentityResolver`]: projects the configured
/// property name lists out of the message, falling back to the event's own
/// sequence number when none are configured.
#[derive(Debug)]
pub struct DefaultIdentityResolver {
    id_property_names: Vec<String>,
    key_property_names: Vec<String>,
    seq_no_property_names: Vec<String>,
}

impl DefaultIdentityResolver {
    pub fn new(config: &ConsumerConfig) -> Self {
        DefaultIdentityResolver {
            id_property_names: config.id_property_names.clone(),
            key_property_names: config.key_property_names.clone(),
            seq_no_property_names: config.seq_no_property_names.clone(),
        }
    }
}

impl MessageIdentityResolver for DefaultIdentityResolver {
    fn resolve(
        &self,
        message: &Value,
        _record: &Value,
        _user_record: Option<&Value>,
        coords: &EventCoordinates,
        _digests: &Digests,
    ) -> Result<(PropertyList, PropertyList, PropertyList)> {
        let identity = identifiers::resolve_message_identity(
            message,
            coords,
            &self.id_property_names,
            &self.key_property_names,
            &self.seq_no_property_names,
        );
        Ok((identity.ids, identity.keys, identity.seq_nos))
    }
}

/// Builds a full [`MessageIdentity`] from the raw projection triple plus
/// coordinates, computing the joined string forms and log description.
pub fn build_identity(
    ids: PropertyList,
    keys: PropertyList,
    seq_nos: PropertyList,
    coords: &EventCoordinates,
) -> MessageIdentity {
    let id = identifiers::join_property_list(&ids);
    let key = identifiers::join_property_list(&keys);
    let seq_no = identifiers::join_property_list(&seq_nos);
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
