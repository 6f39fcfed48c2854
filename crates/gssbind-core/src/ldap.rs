//! The slice of LDAPv3 needed for a SASL bind.
//!
//! Only `BindRequest`, `BindResponse` and `UnbindRequest` are modelled.
//! Other operations travel as raw [`Tag`]s in an [`LdapMessage`] envelope.
//! BER encoding and decoding go through `ldap3::asn1`.

use std::fmt;

use bytes::BytesMut;
use ldap3::asn1::{ASNTag, Integer, Null, OctetString, PL, Sequence, Types, parse_tag, parse_uint, write};

pub use ldap3::asn1::{StructureTag, Tag, TagClass};

pub const LDAP_VERSION: i64 = 3;

const BIND_REQUEST: u64 = 0;
const BIND_RESPONSE: u64 = 1;
const UNBIND_REQUEST: u64 = 2;
const EXTENDED_RESPONSE: u64 = 24;
const SASL_CREDENTIALS: u64 = 3;
const SERVER_SASL_CREDS: u64 = 7;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode LDAP message: {0}")]
    Encode(#[source] std::io::Error),

    #[error("malformed LDAP message: {0}")]
    Malformed(&'static str),

    #[error("BER length of {0} bytes is not supported")]
    LengthTooLarge(usize),

    #[error("expected response to message {expected}, got {actual}")]
    UnexpectedMessageId { expected: i32, actual: i32 },

    #[error("server sent notice of disconnection: {0}")]
    Disconnected(String),

    #[error("unexpected LDAP operation [{class:?} {id}]")]
    UnexpectedOperation { class: TagClass, id: u64 },
}

/// LDAP result code (RFC 4511 section 4.1.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: Self = Self(0);
    pub const OPERATIONS_ERROR: Self = Self(1);
    pub const PROTOCOL_ERROR: Self = Self(2);
    pub const AUTH_METHOD_NOT_SUPPORTED: Self = Self(7);
    pub const STRONGER_AUTH_REQUIRED: Self = Self(8);
    pub const SASL_BIND_IN_PROGRESS: Self = Self(14);
    pub const INAPPROPRIATE_AUTHENTICATION: Self = Self(48);
    pub const INVALID_CREDENTIALS: Self = Self(49);
    pub const INSUFFICIENT_ACCESS_RIGHTS: Self = Self(50);
    pub const BUSY: Self = Self(51);
    pub const UNAVAILABLE: Self = Self(52);
    pub const UNWILLING_TO_PERFORM: Self = Self(53);
    pub const OTHER: Self = Self(80);

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "success",
            1 => "operationsError",
            2 => "protocolError",
            7 => "authMethodNotSupported",
            8 => "strongerAuthRequired",
            14 => "saslBindInProgress",
            48 => "inappropriateAuthentication",
            49 => "invalidCredentials",
            50 => "insufficientAccessRights",
            51 => "busy",
            52 => "unavailable",
            53 => "unwillingToPerform",
            80 => "other",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// A decoded `LDAPMessage`. Controls are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub operation: StructureTag,
}

impl LdapMessage {
    /// Result code of a response operation, which always leads with an `LDAPResult`.
    pub fn result_code(&self) -> Option<ResultCode> {
        let PL::C(fields) = &self.operation.payload else {
            return None;
        };
        let code = primitive_uint(fields.first()?.clone(), "result code").ok()?;
        u32::try_from(code).ok().map(ResultCode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub message_id: i32,
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub server_sasl_creds: Option<Vec<u8>>,
}

impl BindResponse {
    pub fn is_success(&self) -> bool {
        self.result_code == ResultCode::SUCCESS
    }

    pub fn in_progress(&self) -> bool {
        self.result_code == ResultCode::SASL_BIND_IN_PROGRESS
    }
}

/// Encodes an anonymous-name SASL `BindRequest`.
///
/// `credentials` of `None` omits the field; `Some(&[])` sends it empty.
pub fn encode_sasl_bind_request(
    message_id: i32,
    mechanism: &str,
    credentials: Option<&[u8]>,
) -> Result<Vec<u8>, ProtocolError> {
    encode_request(message_id, sasl_bind_operation(mechanism, credentials))
}

/// The `BindRequest` protocol operation alone, ready for [`encode_request`].
pub fn sasl_bind_operation(mechanism: &str, credentials: Option<&[u8]>) -> Tag {
    let mut sasl = vec![Tag::OctetString(OctetString {
        inner: mechanism.as_bytes().to_vec(),
        ..Default::default()
    })];
    if let Some(credentials) = credentials {
        sasl.push(Tag::OctetString(OctetString {
            inner: credentials.to_vec(),
            ..Default::default()
        }));
    }

    Tag::Sequence(Sequence {
        id: BIND_REQUEST,
        class: TagClass::Application,
        inner: vec![
            Tag::Integer(Integer {
                inner: LDAP_VERSION,
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: Vec::new(),
                ..Default::default()
            }),
            Tag::Sequence(Sequence {
                id: SASL_CREDENTIALS,
                class: TagClass::Context,
                inner: sasl,
            }),
        ],
    })
}

pub fn encode_unbind_request(message_id: i32) -> Result<Vec<u8>, ProtocolError> {
    encode_request(
        message_id,
        Tag::Null(Null {
            id: UNBIND_REQUEST,
            class: TagClass::Application,
            inner: (),
        }),
    )
}

/// Wraps `operation` in an `LDAPMessage` envelope.
pub fn encode_request(message_id: i32, operation: Tag) -> Result<Vec<u8>, ProtocolError> {
    let envelope = Tag::Sequence(Sequence {
        inner: vec![
            Tag::Integer(Integer {
                inner: i64::from(message_id),
                ..Default::default()
            }),
            operation,
        ],
        ..Default::default()
    });

    let mut buf = BytesMut::new();
    write::encode_into(&mut buf, envelope.into_structure()).map_err(ProtocolError::Encode)?;
    Ok(buf.to_vec())
}

/// Total size of the BER element at the start of `buf`, once its header is complete.
///
/// Returns `Ok(None)` while more bytes are needed to know the size.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(&first) = buf.get(1) else {
        return Ok(None);
    };

    if first & 0x80 == 0 {
        return Ok(Some(2 + usize::from(first)));
    }

    let octets = usize::from(first & 0x7f);
    if octets == 0 {
        return Err(ProtocolError::Malformed("indefinite length"));
    }
    if octets > std::mem::size_of::<u32>() {
        return Err(ProtocolError::LengthTooLarge(octets));
    }
    let Some(length_bytes) = buf.get(2..2 + octets) else {
        return Ok(None);
    };

    let length = length_bytes
        .iter()
        .fold(0usize, |acc, byte| (acc << 8) | usize::from(*byte));
    Ok(Some(2 + octets + length))
}

/// Decodes one complete `LDAPMessage`.
///
/// An unsolicited notice of disconnection is returned as
/// [`ProtocolError::Disconnected`].
pub fn decode_message(frame: &[u8]) -> Result<LdapMessage, ProtocolError> {
    let (_, envelope) =
        parse_tag(frame).map_err(|_| ProtocolError::Malformed("invalid BER envelope"))?;
    if envelope.class != TagClass::Universal || envelope.id != Types::Sequence as u64 {
        return Err(ProtocolError::Malformed("LDAPMessage is not a SEQUENCE"));
    }

    let mut parts = envelope
        .expect_constructed()
        .ok_or(ProtocolError::Malformed("LDAPMessage is not constructed"))?
        .into_iter();

    let message_id = parts
        .next()
        .ok_or(ProtocolError::Malformed("missing message id"))
        .and_then(|tag| primitive_uint(tag, "message id"))
        .and_then(|id| i32::try_from(id).map_err(|_| ProtocolError::Malformed("message id out of range")))?;

    let operation = parts
        .next()
        .ok_or(ProtocolError::Malformed("missing protocol operation"))?;

    if message_id == 0 && operation.class == TagClass::Application && operation.id == EXTENDED_RESPONSE {
        let notice = decode_bind_body(message_id, operation)?;
        return Err(ProtocolError::Disconnected(format!(
            "{}: {}",
            notice.result_code, notice.diagnostic_message
        )));
    }

    Ok(LdapMessage {
        message_id,
        operation,
    })
}

/// Decodes one complete `LDAPMessage` that must carry a `BindResponse`.
pub fn decode_bind_response(frame: &[u8]) -> Result<BindResponse, ProtocolError> {
    BindResponse::try_from(decode_message(frame)?)
}

impl TryFrom<LdapMessage> for BindResponse {
    type Error = ProtocolError;

    fn try_from(message: LdapMessage) -> Result<Self, ProtocolError> {
        let LdapMessage {
            message_id,
            operation,
        } = message;

        match (operation.class, operation.id) {
            (TagClass::Application, BIND_RESPONSE) => decode_bind_body(message_id, operation),
            (class, id) => Err(ProtocolError::UnexpectedOperation { class, id }),
        }
    }
}

// BindResponse and ExtendedResponse share the LDAPResult prefix.
fn decode_bind_body(message_id: i32, operation: StructureTag) -> Result<BindResponse, ProtocolError> {
    let mut fields = operation
        .expect_constructed()
        .ok_or(ProtocolError::Malformed("BindResponse is not constructed"))?
        .into_iter();

    let code = fields
        .next()
        .ok_or(ProtocolError::Malformed("missing result code"))
        .and_then(|tag| primitive_uint(tag, "result code"))?;
    let result_code = ResultCode(
        u32::try_from(code).map_err(|_| ProtocolError::Malformed("result code out of range"))?,
    );

    let matched_dn = fields
        .next()
        .ok_or(ProtocolError::Malformed("missing matched DN"))
        .and_then(|tag| primitive_string(tag, "matched DN"))?;
    let diagnostic_message = fields
        .next()
        .ok_or(ProtocolError::Malformed("missing diagnostic message"))
        .and_then(|tag| primitive_string(tag, "diagnostic message"))?;

    let mut server_sasl_creds = None;
    for field in fields {
        if field.class == TagClass::Context && field.id == SERVER_SASL_CREDS {
            server_sasl_creds = Some(
                field
                    .expect_primitive()
                    .ok_or(ProtocolError::Malformed("serverSaslCreds is constructed"))?,
            );
        }
    }

    Ok(BindResponse {
        message_id,
        result_code,
        matched_dn,
        diagnostic_message,
        server_sasl_creds,
    })
}

fn primitive_uint(tag: StructureTag, what: &'static str) -> Result<u64, ProtocolError> {
    match tag.payload {
        PL::P(bytes) if !bytes.is_empty() => parse_uint(&bytes)
            .map(|(_, value)| value)
            .map_err(|_| ProtocolError::Malformed(what)),
        _ => Err(ProtocolError::Malformed(what)),
    }
}

fn primitive_string(tag: StructureTag, what: &'static str) -> Result<String, ProtocolError> {
    tag.expect_primitive()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .ok_or(ProtocolError::Malformed(what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_sasl_bind_without_credentials() {
        let encoded = encode_sasl_bind_request(1, "GSSAPI", None).unwrap();
        let expected = [
            0x30, 0x14, 0x02, 0x01, 0x01, 0x60, 0x0f, 0x02, 0x01, 0x03, 0x04, 0x00, 0xa3, 0x08,
            0x04, 0x06, b'G', b'S', b'S', b'A', b'P', b'I',
        ];
        assert_eq!(encoded, expected);
    }

    #[test]
    fn encodes_empty_credentials_when_present() {
        let encoded = encode_sasl_bind_request(2, "GSSAPI", Some(&[])).unwrap();
        assert_eq!(&encoded[..2], [0x30, 0x16]);
        assert!(encoded.ends_with(b"GSSAPI\x04\x00"));
    }

    #[test]
    fn encodes_unbind() {
        let encoded = encode_unbind_request(7).unwrap();
        assert_eq!(encoded, [0x30, 0x05, 0x02, 0x01, 0x07, 0x42, 0x00]);
    }

    #[test]
    fn decodes_bind_response_with_server_credentials() {
        let frame = [
            0x30, 0x11, 0x02, 0x01, 0x01, 0x61, 0x0c, 0x0a, 0x01, 0x0e, 0x04, 0x00, 0x04, 0x00,
            0x87, 0x03, 0xaa, 0xbb, 0xcc,
        ];
        let response = decode_bind_response(&frame).unwrap();
        assert_eq!(response.message_id, 1);
        assert!(response.in_progress());
        assert_eq!(response.server_sasl_creds.as_deref(), Some(&[0xaa, 0xbb, 0xcc][..]));
    }

    #[test]
    fn decodes_rejection_with_diagnostic() {
        let mut body = vec![0x0a, 0x01, 0x31, 0x04, 0x00, 0x04, 0x03];
        body.extend_from_slice(b"bad");
        let mut frame = vec![0x30, 0x0f, 0x02, 0x01, 0x03, 0x61, 0x0a];
        frame.extend_from_slice(&body);

        let response = decode_bind_response(&frame).unwrap();
        assert_eq!(response.result_code, ResultCode::INVALID_CREDENTIALS);
        assert_eq!(response.diagnostic_message, "bad");
        assert_eq!(response.server_sasl_creds, None);
        assert_eq!(response.result_code.to_string(), "invalidCredentials (49)");
    }

    #[test]
    fn notice_of_disconnection_is_reported() {
        let frame = [
            0x30, 0x0c, 0x02, 0x01, 0x00, 0x78, 0x07, 0x0a, 0x01, 0x34, 0x04, 0x00, 0x04, 0x00,
        ];
        assert!(matches!(
            decode_bind_response(&frame),
            Err(ProtocolError::Disconnected(message)) if message.starts_with("unavailable")
        ));
    }

    #[test]
    fn other_operations_decode_as_raw_messages() {
        // ExtendedResponse to a WhoAmI request, carrying a responseValue.
        let frame = [
            0x30, 0x12, 0x02, 0x01, 0x04, 0x78, 0x0d, 0x0a, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00,
            0x8b, 0x05, b'u', b':', b'b', b'o', b'b',
        ];
        let message = decode_message(&frame).unwrap();
        assert_eq!(message.message_id, 4);
        assert_eq!((message.operation.class, message.operation.id), (TagClass::Application, 24));
        assert_eq!(message.result_code(), Some(ResultCode::SUCCESS));

        assert!(matches!(
            decode_bind_response(&frame),
            Err(ProtocolError::UnexpectedOperation { id: 24, .. })
        ));
    }

    #[test]
    fn arbitrary_requests_get_an_envelope() {
        let abandon = Tag::Integer(Integer {
            id: 16,
            class: TagClass::Application,
            inner: 3,
        });
        assert_eq!(
            encode_request(5, abandon).unwrap(),
            [0x30, 0x06, 0x02, 0x01, 0x05, 0x50, 0x01, 0x03]
        );
    }

    #[test]
    fn frame_length_handles_short_and_long_forms() {
        assert_eq!(frame_length(&[0x30]).unwrap(), None);
        assert_eq!(frame_length(&[0x30, 0x05]).unwrap(), Some(7));
        assert_eq!(frame_length(&[0x30, 0x82, 0x01]).unwrap(), None);
        assert_eq!(frame_length(&[0x30, 0x82, 0x01, 0x00]).unwrap(), Some(260));
        assert!(frame_length(&[0x30, 0x80]).is_err());
        assert!(frame_length(&[0x30, 0x89]).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            decode_bind_response(&[0x02, 0x01, 0x01]),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
