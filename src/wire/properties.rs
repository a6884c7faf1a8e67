//! The `basic` content-header property list.
//!
//! Properties are optional on the wire; a 16-bit flag word records which are
//! present, highest bit first, and present properties follow positionally.

use super::types::{encode_shortstr, Cursor, DecodeResult, EncodeResult, FieldTable};

const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_CONTENT_ENCODING: u16 = 1 << 14;
const FLAG_HEADERS: u16 = 1 << 13;
const FLAG_DELIVERY_MODE: u16 = 1 << 12;
const FLAG_PRIORITY: u16 = 1 << 11;
const FLAG_CORRELATION_ID: u16 = 1 << 10;
const FLAG_REPLY_TO: u16 = 1 << 9;
const FLAG_EXPIRATION: u16 = 1 << 8;
const FLAG_MESSAGE_ID: u16 = 1 << 7;
const FLAG_TIMESTAMP: u16 = 1 << 6;
const FLAG_TYPE: u16 = 1 << 5;
const FLAG_USER_ID: u16 = 1 << 4;
const FLAG_APP_ID: u16 = 1 << 3;
const FLAG_CLUSTER_ID: u16 = 1 << 2;

/// Properties attached to published and delivered messages.
///
/// Build with the `with_*` methods:
///
/// ```rust
/// use coney::AmqpProperties;
///
/// let properties = AmqpProperties::default()
///     .with_content_type("application/json".to_string())
///     .with_delivery_mode(2);
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AmqpProperties {
    content_type: Option<String>,
    content_encoding: Option<String>,
    headers: Option<FieldTable>,
    delivery_mode: Option<u8>,
    priority: Option<u8>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    expiration: Option<String>,
    message_id: Option<String>,
    timestamp: Option<u64>,
    type_: Option<String>,
    user_id: Option<String>,
    app_id: Option<String>,
    cluster_id: Option<String>,
}

macro_rules! property_accessors {
    ($field:ident, $with:ident, $ty:ty) => {
        pub fn $with(mut self, value: $ty) -> Self {
            self.$field = Some(value);
            self
        }

        pub fn $field(&self) -> Option<&$ty> {
            self.$field.as_ref()
        }
    };
}

impl AmqpProperties {
    property_accessors!(content_type, with_content_type, String);
    property_accessors!(content_encoding, with_content_encoding, String);
    property_accessors!(headers, with_headers, FieldTable);
    property_accessors!(delivery_mode, with_delivery_mode, u8);
    property_accessors!(priority, with_priority, u8);
    property_accessors!(correlation_id, with_correlation_id, String);
    property_accessors!(reply_to, with_reply_to, String);
    property_accessors!(expiration, with_expiration, String);
    property_accessors!(message_id, with_message_id, String);
    property_accessors!(timestamp, with_timestamp, u64);
    property_accessors!(type_, with_type, String);
    property_accessors!(user_id, with_user_id, String);
    property_accessors!(app_id, with_app_id, String);
    property_accessors!(cluster_id, with_cluster_id, String);

    fn flags(&self) -> u16 {
        let mut flags = 0;
        let mut set = |present: bool, flag: u16| {
            if present {
                flags |= flag;
            }
        };
        set(self.content_type.is_some(), FLAG_CONTENT_TYPE);
        set(self.content_encoding.is_some(), FLAG_CONTENT_ENCODING);
        set(self.headers.is_some(), FLAG_HEADERS);
        set(self.delivery_mode.is_some(), FLAG_DELIVERY_MODE);
        set(self.priority.is_some(), FLAG_PRIORITY);
        set(self.correlation_id.is_some(), FLAG_CORRELATION_ID);
        set(self.reply_to.is_some(), FLAG_REPLY_TO);
        set(self.expiration.is_some(), FLAG_EXPIRATION);
        set(self.message_id.is_some(), FLAG_MESSAGE_ID);
        set(self.timestamp.is_some(), FLAG_TIMESTAMP);
        set(self.type_.is_some(), FLAG_TYPE);
        set(self.user_id.is_some(), FLAG_USER_ID);
        set(self.app_id.is_some(), FLAG_APP_ID);
        set(self.cluster_id.is_some(), FLAG_CLUSTER_ID);
        flags
    }

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) -> EncodeResult {
        buf.extend_from_slice(&self.flags().to_be_bytes());
        if let Some(v) = &self.content_type {
            encode_shortstr(buf, v)?;
        }
        if let Some(v) = &self.content_encoding {
            encode_shortstr(buf, v)?;
        }
        if let Some(v) = &self.headers {
            v.encode(buf)?;
        }
        if let Some(v) = self.delivery_mode {
            buf.push(v);
        }
        if let Some(v) = self.priority {
            buf.push(v);
        }
        if let Some(v) = &self.correlation_id {
            encode_shortstr(buf, v)?;
        }
        if let Some(v) = &self.reply_to {
            encode_shortstr(buf, v)?;
        }
        if let Some(v) = &self.expiration {
            encode_shortstr(buf, v)?;
        }
        if let Some(v) = &self.message_id {
            encode_shortstr(buf, v)?;
        }
        if let Some(v) = self.timestamp {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(v) = &self.type_ {
            encode_shortstr(buf, v)?;
        }
        if let Some(v) = &self.user_id {
            encode_shortstr(buf, v)?;
        }
        if let Some(v) = &self.app_id {
            encode_shortstr(buf, v)?;
        }
        if let Some(v) = &self.cluster_id {
            encode_shortstr(buf, v)?;
        }
        Ok(())
    }

    pub(crate) fn decode(c: &mut Cursor<'_>) -> DecodeResult<AmqpProperties> {
        let flags = c.take_u16()?;
        let mut properties = AmqpProperties::default();
        if flags & FLAG_CONTENT_TYPE != 0 {
            properties.content_type = Some(c.take_shortstr()?);
        }
        if flags & FLAG_CONTENT_ENCODING != 0 {
            properties.content_encoding = Some(c.take_shortstr()?);
        }
        if flags & FLAG_HEADERS != 0 {
            properties.headers = Some(c.take_table()?);
        }
        if flags & FLAG_DELIVERY_MODE != 0 {
            properties.delivery_mode = Some(c.take_u8()?);
        }
        if flags & FLAG_PRIORITY != 0 {
            properties.priority = Some(c.take_u8()?);
        }
        if flags & FLAG_CORRELATION_ID != 0 {
            properties.correlation_id = Some(c.take_shortstr()?);
        }
        if flags & FLAG_REPLY_TO != 0 {
            properties.reply_to = Some(c.take_shortstr()?);
        }
        if flags & FLAG_EXPIRATION != 0 {
            properties.expiration = Some(c.take_shortstr()?);
        }
        if flags & FLAG_MESSAGE_ID != 0 {
            properties.message_id = Some(c.take_shortstr()?);
        }
        if flags & FLAG_TIMESTAMP != 0 {
            properties.timestamp = Some(c.take_u64()?);
        }
        if flags & FLAG_TYPE != 0 {
            properties.type_ = Some(c.take_shortstr()?);
        }
        if flags & FLAG_USER_ID != 0 {
            properties.user_id = Some(c.take_shortstr()?);
        }
        if flags & FLAG_APP_ID != 0 {
            properties.app_id = Some(c.take_shortstr()?);
        }
        if flags & FLAG_CLUSTER_ID != 0 {
            properties.cluster_id = Some(c.take_shortstr()?);
        }
        Ok(properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::types::FieldValue;

    #[test]
    fn empty_properties_are_two_flag_bytes() {
        let mut buf = Vec::new();
        AmqpProperties::default().encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0, 0]);
    }

    #[test]
    fn full_roundtrip() {
        let mut headers = FieldTable::new();
        headers.insert("retries", FieldValue::ShortShortUInt(3));
        let properties = AmqpProperties::default()
            .with_content_type("text/plain".to_string())
            .with_headers(headers)
            .with_delivery_mode(2)
            .with_priority(5)
            .with_correlation_id("corr-1".to_string())
            .with_reply_to("amq.rabbitmq.reply-to".to_string())
            .with_timestamp(1_600_000_000)
            .with_app_id("coney-tests".to_string());

        let mut buf = Vec::new();
        properties.encode(&mut buf).unwrap();
        let mut cursor = Cursor::new(&buf);
        let decoded = AmqpProperties::decode(&mut cursor).unwrap();
        assert_eq!(cursor.remaining(), 0);
        assert_eq!(decoded, properties);
    }

    #[test]
    fn overlong_property_is_an_encode_error() {
        let properties =
            AmqpProperties::default().with_correlation_id("c".repeat(300));
        assert!(properties.encode(&mut Vec::new()).is_err());
    }

    #[test]
    fn skipped_properties_do_not_shift_later_ones() {
        let properties = AmqpProperties::default()
            .with_expiration("60000".to_string())
            .with_cluster_id("c".to_string());
        let mut buf = Vec::new();
        properties.encode(&mut buf).unwrap();
        let decoded = AmqpProperties::decode(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded.expiration(), Some(&"60000".to_string()));
        assert_eq!(decoded.cluster_id(), Some(&"c".to_string()));
        assert_eq!(decoded.priority(), None);
    }
}
