//! DHT sub-messages carried in [`MessageType::Dht`] frames.
//!
//! The body is a CBOR map with single-letter text keys, written in this order:
//!
//! | key | type | meaning |
//! |---|---|---|
//! | `m` | text | method (`PUT`, `GET`, `MPUT`, `MGET`, `NACK`) |
//! | `r` | int  | present when the message is a reply |
//! | `t` | int  | transaction id |
//! | `h` | int  | hop count |
//! | `d` | bytes | payload: a hash for `GET`/`MGET`/`NACK`, a record for `PUT`/`MPUT` |
//!
//! Unknown keys are ignored. A request without a method, a non-map body or a
//! wrongly typed field rejects that one message.

use ciborium::Value;

use crate::cbor;
use crate::frame::{Message, MessageType};
use crate::{Result, TransportError};

/// Store a chunk.
pub const METHOD_PUT: &str = "PUT";
/// Fetch a chunk by content hash.
pub const METHOD_GET: &str = "GET";
/// Store a manifest under its root hash.
pub const METHOD_MPUT: &str = "MPUT";
/// Fetch a manifest by root hash.
pub const METHOD_MGET: &str = "MGET";
/// Negative reply: the sender could not serve or forward the request.
pub const METHOD_NACK: &str = "NACK";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhtMessage {
    pub method: String,
    pub transaction_id: i64,
    pub hop_count: i64,
    pub is_reply: bool,
    pub payload: Vec<u8>,
}

impl DhtMessage {
    /// A fresh request with hop count zero.
    pub fn request(method: &str, transaction_id: i64, payload: Vec<u8>) -> Self {
        Self {
            method: method.to_string(),
            transaction_id,
            hop_count: 0,
            is_reply: false,
            payload,
        }
    }

    /// A reply to `request` echoing its method and transaction id, hop count zero.
    pub fn reply_to(request: &DhtMessage, payload: Vec<u8>) -> Self {
        Self {
            method: request.method.clone(),
            transaction_id: request.transaction_id,
            hop_count: 0,
            is_reply: true,
            payload,
        }
    }

    /// A NACK for `transaction_id`; the payload names the target.
    pub fn nack(transaction_id: i64, target: &[u8]) -> Self {
        Self {
            method: METHOD_NACK.to_string(),
            transaction_id,
            hop_count: 0,
            is_reply: true,
            payload: target.to_vec(),
        }
    }

    pub fn is_nack(&self) -> bool {
        self.method.eq_ignore_ascii_case(METHOD_NACK)
    }

    /// The same message one hop further along.
    pub fn forwarded(&self) -> Self {
        Self {
            hop_count: self.hop_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Encode as a CBOR map.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut entries = Vec::with_capacity(5);
        if !self.method.is_empty() {
            entries.push((text("m"), Value::Text(self.method.clone())));
        }
        if self.is_reply {
            entries.push((text("r"), Value::Integer(1.into())));
        }
        entries.push((text("t"), Value::Integer(self.transaction_id.into())));
        entries.push((text("h"), Value::Integer(self.hop_count.into())));
        entries.push((text("d"), Value::Bytes(self.payload.clone())));
        cbor::to_vec(&Value::Map(entries))
    }

    /// Decode a CBOR map body.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Deserialization`] for malformed CBOR, a non-map
    ///   body, non-text keys, wrongly typed values or a negative hop count
    /// - [`TransportError::MissingField`] for a request without `m`
    pub fn decode(body: &[u8]) -> Result<Self> {
        let entries = match cbor::value_from_slice(body)? {
            Value::Map(entries) => entries,
            _ => {
                return Err(TransportError::Deserialization(
                    "DHT body is not a map".into(),
                ))
            }
        };

        let mut method = None;
        let mut is_reply = false;
        let mut transaction_id = 0i64;
        let mut hop_count = 0i64;
        let mut payload = Vec::new();

        for (key, value) in entries {
            let key = match key {
                Value::Text(key) => key,
                other => {
                    return Err(TransportError::Deserialization(format!(
                        "non-text key in DHT map: {other:?}"
                    )))
                }
            };
            match key.as_str() {
                "m" => match value {
                    Value::Text(m) => method = Some(m),
                    _ => return Err(field_type("m")),
                },
                "r" => is_reply = !matches!(value, Value::Null | Value::Bool(false)),
                "t" => transaction_id = integer(value, "t")?,
                "h" => {
                    hop_count = integer(value, "h")?;
                    if hop_count < 0 {
                        return Err(TransportError::Deserialization(format!(
                            "negative hop count {hop_count}"
                        )));
                    }
                }
                "d" => {
                    payload = match value {
                        Value::Bytes(bytes) => bytes,
                        Value::Text(text) => text.into_bytes(),
                        _ => return Err(field_type("d")),
                    }
                }
                _ => {}
            }
        }

        let method = match method {
            Some(m) if !m.is_empty() => m.to_ascii_uppercase(),
            _ if is_reply => String::new(),
            _ => return Err(TransportError::MissingField("m")),
        };

        Ok(Self {
            method,
            transaction_id,
            hop_count,
            is_reply,
            payload,
        })
    }

    /// Wrap in an unsigned DHT frame.
    pub fn to_message(&self) -> Result<Message> {
        Ok(Message::new(MessageType::Dht, self.encode()?))
    }

    /// Unwrap from a DHT frame.
    pub fn from_message(message: &Message) -> Result<Self> {
        if message.msg_type != MessageType::Dht {
            return Err(TransportError::Deserialization(format!(
                "expected a DHT frame, got {:?}",
                message.msg_type
            )));
        }
        Self::decode(&message.body)
    }
}

fn text(key: &str) -> Value {
    Value::Text(key.to_string())
}

fn integer(value: Value, field: &'static str) -> Result<i64> {
    match value {
        Value::Integer(i) => i64::try_from(i).map_err(|_| field_type(field)),
        _ => Err(field_type(field)),
    }
}

fn field_type(field: &str) -> TransportError {
    TransportError::Deserialization(format!("DHT field `{field}` has the wrong type"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_value(value: Value) -> Vec<u8> {
        cbor::to_vec(&value).expect("encode value")
    }

    #[test]
    fn test_request_roundtrip() {
        let msg = DhtMessage::request(METHOD_GET, -42, vec![0xAB; 32]);
        let decoded = DhtMessage::decode(&msg.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, msg);
        assert!(!decoded.is_reply);
    }

    #[test]
    fn test_reply_and_nack() {
        let req = DhtMessage::request(METHOD_PUT, 7, b"chunk".to_vec()).forwarded();
        assert_eq!(req.hop_count, 1);

        let reply = DhtMessage::reply_to(&req, vec![1, 2, 3]);
        assert!(reply.is_reply);
        assert_eq!(reply.hop_count, 0);
        assert_eq!(reply.transaction_id, 7);
        assert_eq!(reply.method, METHOD_PUT);

        let nack = DhtMessage::nack(7, &[9u8; 32]);
        assert!(nack.is_nack());
        let decoded = DhtMessage::decode(&nack.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, nack);
    }

    #[test]
    fn test_key_order() {
        let msg = DhtMessage::reply_to(&DhtMessage::request(METHOD_GET, 1, vec![]), vec![]);
        let value = cbor::value_from_slice(&msg.encode().expect("encode")).expect("value");
        let keys: Vec<String> = match value {
            Value::Map(entries) => entries
                .into_iter()
                .filter_map(|(k, _)| match k {
                    Value::Text(k) => Some(k),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        assert_eq!(keys, vec!["m", "r", "t", "h", "d"]);
    }

    #[test]
    fn test_request_without_method_rejected() {
        let body = encode_value(Value::Map(vec![
            (text("t"), Value::Integer(1.into())),
            (text("d"), Value::Bytes(vec![1])),
        ]));
        let err = DhtMessage::decode(&body).expect_err("missing method");
        assert!(matches!(err, TransportError::MissingField("m")));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_reply_without_method_accepted() {
        let body = encode_value(Value::Map(vec![
            (text("r"), Value::Integer(1.into())),
            (text("t"), Value::Integer(5.into())),
        ]));
        let msg = DhtMessage::decode(&body).expect("decode");
        assert!(msg.is_reply);
        assert!(msg.method.is_empty());
        assert_eq!(msg.transaction_id, 5);
    }

    #[test]
    fn test_wrong_types_rejected() {
        let not_map = encode_value(Value::Array(vec![]));
        assert!(DhtMessage::decode(&not_map).is_err());

        let bad_t = encode_value(Value::Map(vec![
            (text("m"), text("GET")),
            (text("t"), text("seven")),
        ]));
        assert!(matches!(
            DhtMessage::decode(&bad_t),
            Err(TransportError::Deserialization(_))
        ));

        let bad_key = encode_value(Value::Map(vec![(Value::Integer(1.into()), text("GET"))]));
        assert!(DhtMessage::decode(&bad_key).is_err());

        assert!(DhtMessage::decode(&[0xFF, 0x00]).is_err());
    }

    #[test]
    fn test_negative_hop_count_rejected() {
        let body = encode_value(Value::Map(vec![
            (text("m"), text("GET")),
            (text("t"), Value::Integer(3.into())),
            (text("h"), Value::Integer((-1).into())),
        ]));
        assert!(matches!(
            DhtMessage::decode(&body),
            Err(TransportError::Deserialization(_))
        ));
    }

    #[test]
    fn test_unknown_keys_ignored_and_method_normalised() {
        let body = encode_value(Value::Map(vec![
            (text("m"), text("get")),
            (text("x"), Value::Bool(true)),
            (text("t"), Value::Integer(3.into())),
        ]));
        let msg = DhtMessage::decode(&body).expect("decode");
        assert_eq!(msg.method, METHOD_GET);
        assert_eq!(msg.hop_count, 0);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_frame_wrapping() {
        let msg = DhtMessage::request(METHOD_MGET, 99, vec![4u8; 32]);
        let frame = msg.to_message().expect("frame");
        assert_eq!(frame.msg_type, MessageType::Dht);
        assert_eq!(DhtMessage::from_message(&frame).expect("unwrap"), msg);

        let chat = Message::chat("not dht");
        assert!(DhtMessage::from_message(&chat).is_err());
    }
}
