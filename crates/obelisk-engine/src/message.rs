//! Protocol message envelopes.
//!
//! An envelope carries everything the engine needs to route a payload
//! to its protocol instance. Envelopes are immutable once constructed:
//! a message is either *outbound* (being sent) or *inbound* (being
//! processed), never mutated in place.
//!
//! ## Wire Form
//!
//! The envelope is a six-field list, in this fixed order:
//!
//! | # | Field       | Kind  |
//! |---|-------------|-------|
//! | 0 | protocol id | u64   |
//! | 1 | instance id | bytes |
//! | 2 | message tag | u64   |
//! | 3 | sender      | bytes |
//! | 4 | recipient   | bytes |
//! | 5 | payload     | list  |

use obelisk_codec::{decode, encode, CodecError, FieldReader, Value};

use crate::channel::{ChannelIntent, ReceptionChannel};
use crate::types::{IdentityId, InstanceId, InstanceKey, MessageTag, ProtocolId};

const ENVELOPE_FIELDS: usize = 6;

/// The envelope of one protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// The protocol type this message belongs to.
    pub protocol: ProtocolId,
    /// The protocol instance this message belongs to.
    pub instance: InstanceId,
    /// The message type tag.
    pub tag: MessageTag,
    /// The claimed origin identity.
    pub sender: IdentityId,
    /// The identity the message is addressed to.
    pub recipient: IdentityId,
    /// The protocol-specific payload fields.
    pub payload: Value,
}

impl MessageEnvelope {
    /// The instance key this message resolves to on the recipient
    /// side: instances are owned by the identity processing the
    /// message.
    pub fn instance_key(&self) -> InstanceKey {
        InstanceKey {
            protocol: self.protocol,
            instance: self.instance,
            owner: self.recipient,
        }
    }

    /// Encode the envelope to its binary wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(&Value::List(vec![
            Value::U64(u64::from(self.protocol.0)),
            Value::Bytes(self.instance.as_bytes().to_vec()),
            Value::U64(u64::from(self.tag.0)),
            Value::Bytes(self.sender.as_bytes().to_vec()),
            Value::Bytes(self.recipient.as_bytes().to_vec()),
            self.payload.clone(),
        ]))
    }

    /// Decode an envelope from its binary wire form, strictly.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] on any structural defect: wrong field
    /// count, wrong field kinds, identifier fields of the wrong width,
    /// or protocol/tag values outside the `u16` range.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let value = decode(bytes)?;
        let fields = FieldReader::new(&value, ENVELOPE_FIELDS)?;
        Ok(Self {
            protocol: ProtocolId(read_u16(&fields, 0)?),
            instance: InstanceId::from_bytes(fields.bytes_fixed(1)?),
            tag: MessageTag(read_u16(&fields, 2)?),
            sender: IdentityId::from_bytes(fields.bytes_fixed(3)?),
            recipient: IdentityId::from_bytes(fields.bytes_fixed(4)?),
            payload: Value::List(fields.list(5)?.to_vec()),
        })
    }
}

fn read_u16(fields: &FieldReader<'_>, index: usize) -> Result<u16, CodecError> {
    let raw = fields.u64(index)?;
    u16::try_from(raw).map_err(|_| CodecError::FieldType {
        index,
        expected: "u64 (u16 range)",
        got: "u64 (out of range)",
    })
}

/// A message being processed, together with the channel the transport
/// says it actually arrived on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// The decoded envelope.
    pub envelope: MessageEnvelope,
    /// What the transport authenticated about the arrival channel.
    pub channel: ReceptionChannel,
}

/// A message a step wants sent, together with its logical delivery
/// intent. Resolution to concrete channels happens only after the
/// owning transaction commits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundIntent {
    /// The envelope to deliver.
    pub envelope: MessageEnvelope,
    /// Where the message must go.
    pub intent: ChannelIntent,
}
