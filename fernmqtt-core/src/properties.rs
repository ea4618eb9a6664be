//! MQTT 5.0 property types.
//!
//! Every property is a thin newtype over its wire value. Each newtype's
//! `Encoder` impl writes the one-byte property identifier followed by the
//! value; its `Decoder` impl reads only the value (the identifier is
//! consumed by `Property::decode` before dispatching).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{Decoder, Encoder, VariableByteInteger};
use crate::reason::ReasonCode;

macro_rules! scalar_property {
    ($name:ident, $id:expr, $inner:ty) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(pub $inner);

        impl $name {
            pub fn new(value: $inner) -> Self {
                Self(value)
            }
        }

        impl Encoder for $name {
            fn encode(&self, buffer: &mut BytesMut) {
                buffer.put_u8($id);
                self.0.encode(buffer);
            }

            fn encoded_size(&self) -> usize {
                1 + self.0.encoded_size()
            }
        }

        impl Decoder for $name {
            fn decode<T: Buf>(buffer: &mut T) -> crate::Result<Self> {
                Ok(Self(<$inner as Decoder>::decode(buffer)?))
            }
        }
    };
}

macro_rules! bool_property {
    ($name:ident, $id:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub bool);

        impl $name {
            pub fn new(value: bool) -> Self {
                Self(value)
            }
        }

        impl Encoder for $name {
            fn encode(&self, buffer: &mut BytesMut) {
                buffer.put_u8($id);
                self.0.encode(buffer);
            }

            fn encoded_size(&self) -> usize {
                2
            }
        }

        impl Decoder for $name {
            fn decode<T: Buf>(buffer: &mut T) -> crate::Result<Self> {
                Ok(Self(bool::decode(buffer)?))
            }
        }
    };
}

scalar_property!(PayloadFormatIndicator, 0x01, u8);
scalar_property!(MessageExpiryInterval, 0x02, u32);
scalar_property!(ContentType, 0x03, String);
scalar_property!(ResponseTopic, 0x08, String);
scalar_property!(CorrelationData, 0x09, Bytes);
scalar_property!(SubscriptionIdentifier, 0x0b, VariableByteInteger);
scalar_property!(SessionExpiryInterval, 0x11, u32);
scalar_property!(AssignedClientIdentifier, 0x12, String);
scalar_property!(ServerKeepAlive, 0x13, u16);
scalar_property!(AuthenticationMethod, 0x15, String);
scalar_property!(AuthenticationData, 0x16, Bytes);
bool_property!(RequestProblemInformation, 0x17);
scalar_property!(WillDelayInterval, 0x18, u32);
bool_property!(RequestResponseInformation, 0x19);
scalar_property!(ResponseInformation, 0x1a, String);
scalar_property!(ServerReference, 0x1c, String);
scalar_property!(ReasonString, 0x1f, String);
scalar_property!(ReceiveMaximum, 0x21, u16);
scalar_property!(TopicAliasMaximum, 0x22, u16);
scalar_property!(TopicAlias, 0x23, u16);
scalar_property!(MaximumQoS, 0x24, u8);
bool_property!(RetainAvailable, 0x25);
scalar_property!(MaximumPacketSize, 0x27, u32);
bool_property!(WildcardSubscriptionAvailable, 0x28);
bool_property!(SubscriptionIdentifierAvailable, 0x29);
bool_property!(SharedSubscriptionAvailable, 0x2a);

/// Key/value pair; the one MQTT5 property that may repeat within a property list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProperty {
    pub key: String,
    pub value: String,
}

impl UserProperty {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

const USER_PROPERTY_ID: u8 = 0x26;

impl Encoder for UserProperty {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(USER_PROPERTY_ID);
        self.key.encode(buffer);
        self.value.encode(buffer);
    }

    fn encoded_size(&self) -> usize {
        1 + self.key.encoded_size() + self.value.encoded_size()
    }
}

impl Decoder for UserProperty {
    fn decode<T: Buf>(buffer: &mut T) -> crate::Result<Self> {
        let key = String::decode(buffer)?;
        let value = String::decode(buffer)?;
        Ok(Self { key, value })
    }
}

/// A decoded MQTT5 property, tagged by its identifier.
///
/// `Property::decode` is the only entry point used by packet property lists:
/// it reads the identifier byte and dispatches to the matching newtype's
/// value decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    PayloadFormatIndicator(PayloadFormatIndicator),
    MessageExpiryInterval(MessageExpiryInterval),
    ContentType(ContentType),
    ResponseTopic(ResponseTopic),
    CorrelationData(CorrelationData),
    SubscriptionIdentifier(SubscriptionIdentifier),
    SessionExpiryInterval(SessionExpiryInterval),
    AssignedClientIdentifier(AssignedClientIdentifier),
    ServerKeepAlive(ServerKeepAlive),
    AuthenticationMethod(AuthenticationMethod),
    AuthenticationData(AuthenticationData),
    RequestProblemInformation(RequestProblemInformation),
    WillDelayInterval(WillDelayInterval),
    RequestResponseInformation(RequestResponseInformation),
    ResponseInformation(ResponseInformation),
    ServerReference(ServerReference),
    ReasonString(ReasonString),
    ReceiveMaximum(ReceiveMaximum),
    TopicAliasMaximum(TopicAliasMaximum),
    TopicAlias(TopicAlias),
    MaximumQoS(MaximumQoS),
    RetainAvailable(RetainAvailable),
    UserProperty(UserProperty),
    MaximumPacketSize(MaximumPacketSize),
    WildcardSubscriptionAvailable(WildcardSubscriptionAvailable),
    SubscriptionIdentifierAvailable(SubscriptionIdentifierAvailable),
    SharedSubscriptionAvailable(SharedSubscriptionAvailable),
}

impl Decoder for Property {
    fn decode<T: Buf>(buffer: &mut T) -> crate::Result<Self> {
        let id = u8::decode(buffer)?;

        Ok(match id {
            0x01 => Property::PayloadFormatIndicator(PayloadFormatIndicator::decode(buffer)?),
            0x02 => Property::MessageExpiryInterval(MessageExpiryInterval::decode(buffer)?),
            0x03 => Property::ContentType(ContentType::decode(buffer)?),
            0x08 => Property::ResponseTopic(ResponseTopic::decode(buffer)?),
            0x09 => Property::CorrelationData(CorrelationData::decode(buffer)?),
            0x0b => Property::SubscriptionIdentifier(SubscriptionIdentifier::decode(buffer)?),
            0x11 => Property::SessionExpiryInterval(SessionExpiryInterval::decode(buffer)?),
            0x12 => Property::AssignedClientIdentifier(AssignedClientIdentifier::decode(buffer)?),
            0x13 => Property::ServerKeepAlive(ServerKeepAlive::decode(buffer)?),
            0x15 => Property::AuthenticationMethod(AuthenticationMethod::decode(buffer)?),
            0x16 => Property::AuthenticationData(AuthenticationData::decode(buffer)?),
            0x17 => {
                Property::RequestProblemInformation(RequestProblemInformation::decode(buffer)?)
            }
            0x18 => Property::WillDelayInterval(WillDelayInterval::decode(buffer)?),
            0x19 => {
                Property::RequestResponseInformation(RequestResponseInformation::decode(buffer)?)
            }
            0x1a => Property::ResponseInformation(ResponseInformation::decode(buffer)?),
            0x1c => Property::ServerReference(ServerReference::decode(buffer)?),
            0x1f => Property::ReasonString(ReasonString::decode(buffer)?),
            0x21 => Property::ReceiveMaximum(ReceiveMaximum::decode(buffer)?),
            0x22 => Property::TopicAliasMaximum(TopicAliasMaximum::decode(buffer)?),
            0x23 => Property::TopicAlias(TopicAlias::decode(buffer)?),
            0x24 => Property::MaximumQoS(MaximumQoS::decode(buffer)?),
            0x25 => Property::RetainAvailable(RetainAvailable::decode(buffer)?),
            0x26 => Property::UserProperty(UserProperty::decode(buffer)?),
            0x27 => Property::MaximumPacketSize(MaximumPacketSize::decode(buffer)?),
            0x28 => Property::WildcardSubscriptionAvailable(
                WildcardSubscriptionAvailable::decode(buffer)?,
            ),
            0x29 => Property::SubscriptionIdentifierAvailable(
                SubscriptionIdentifierAvailable::decode(buffer)?,
            ),
            0x2a => {
                Property::SharedSubscriptionAvailable(SharedSubscriptionAvailable::decode(buffer)?)
            }
            _ => return Err(ReasonCode::MalformedPacket.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_expiry_interval_roundtrip() {
        let prop = SessionExpiryInterval::new(3600);
        let mut buffer = BytesMut::new();
        prop.encode(&mut buffer);

        assert_eq!(buffer.to_vec(), vec![0x11, 0x00, 0x00, 0x0e, 0x10]);

        let mut bytes = buffer.freeze();
        let id = u8::decode(&mut bytes).unwrap();
        assert_eq!(id, 0x11);
        assert_eq!(SessionExpiryInterval::decode(&mut bytes).unwrap(), prop);
    }

    #[test]
    fn user_property_roundtrip() {
        let prop = UserProperty::new("k", "v");
        let mut buffer = BytesMut::new();
        prop.encode(&mut buffer);

        let mut bytes = buffer.freeze();
        match Property::decode(&mut bytes).unwrap() {
            Property::UserProperty(v) => assert_eq!(v, prop),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_identifier_is_malformed() {
        let mut bytes = Bytes::from(vec![0xee]);
        assert!(Property::decode(&mut bytes).is_err());
    }
}
