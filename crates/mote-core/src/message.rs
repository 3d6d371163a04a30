//! CoAP message model
//!
//! The engine never touches wire bytes itself; it exchanges `CoapMessage`
//! values with the codec collaborator. Only the fields the orchestration layer
//! reads or writes are modelled here.

use crate::errors::{MoteError, Result};
use crate::identifiers::MessageId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// CoAP message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Requires an acknowledgement
    Confirmable,
    /// Does not require an acknowledgement
    NonConfirmable,
    /// Acknowledges a confirmable message, possibly carrying a response
    Acknowledgement,
    /// Rejects a message
    Reset,
}

/// CoAP message code, `class.detail`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Code(u8);

impl Code {
    /// 0.00 Empty
    pub const EMPTY: Code = Code::new(0, 0);
    /// 0.01 GET
    pub const GET: Code = Code::new(0, 1);
    /// 0.02 POST
    pub const POST: Code = Code::new(0, 2);
    /// 0.03 PUT
    pub const PUT: Code = Code::new(0, 3);
    /// 0.04 DELETE
    pub const DELETE: Code = Code::new(0, 4);
    /// 0.05 FETCH
    pub const FETCH: Code = Code::new(0, 5);
    /// 0.06 PATCH
    pub const PATCH: Code = Code::new(0, 6);
    /// 0.07 iPATCH
    pub const IPATCH: Code = Code::new(0, 7);
    /// 2.01 Created
    pub const CREATED: Code = Code::new(2, 1);
    /// 2.02 Deleted
    pub const DELETED: Code = Code::new(2, 2);
    /// 2.03 Valid
    pub const VALID: Code = Code::new(2, 3);
    /// 2.04 Changed
    pub const CHANGED: Code = Code::new(2, 4);
    /// 2.05 Content
    pub const CONTENT: Code = Code::new(2, 5);
    /// 2.31 Continue
    pub const CONTINUE: Code = Code::new(2, 31);
    /// 4.00 Bad Request
    pub const BAD_REQUEST: Code = Code::new(4, 0);
    /// 4.01 Unauthorized
    pub const UNAUTHORIZED: Code = Code::new(4, 1);
    /// 4.03 Forbidden
    pub const FORBIDDEN: Code = Code::new(4, 3);
    /// 4.04 Not Found
    pub const NOT_FOUND: Code = Code::new(4, 4);
    /// 4.05 Method Not Allowed
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    /// 4.13 Request Entity Too Large
    pub const REQUEST_ENTITY_TOO_LARGE: Code = Code::new(4, 13);
    /// 5.00 Internal Server Error
    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
    /// 5.03 Service Unavailable
    pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 3);

    /// Build a code from its class (0..=7) and detail (0..=31)
    pub const fn new(class: u8, detail: u8) -> Self {
        Self(((class & 0x07) << 5) | (detail & 0x1f))
    }

    /// Wrap a raw code byte
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw code byte
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Code class (the digit before the dot)
    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    /// Code detail (the two digits after the dot)
    pub const fn detail(self) -> u8 {
        self.0 & 0x1f
    }

    /// Request codes occupy 0.01..=0.31
    pub const fn is_request(self) -> bool {
        self.0 > 0 && self.0 < 32
    }

    /// 0.00
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Response codes are class 2 and above
    pub const fn is_response(self) -> bool {
        self.class() >= 2
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

bitflags::bitflags! {
    /// Set of request methods a URI registration accepts.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MethodMask: u8 {
        /// GET
        const GET = 1 << 0;
        /// POST
        const POST = 1 << 1;
        /// PUT
        const PUT = 1 << 2;
        /// DELETE
        const DELETE = 1 << 3;
        /// FETCH
        const FETCH = 1 << 4;
        /// PATCH
        const PATCH = 1 << 5;
        /// iPATCH
        const IPATCH = 1 << 6;
    }
}

impl MethodMask {
    /// The single-method mask for a request code; empty for non-requests
    pub fn for_code(code: Code) -> Self {
        match code {
            Code::GET => Self::GET,
            Code::POST => Self::POST,
            Code::PUT => Self::PUT,
            Code::DELETE => Self::DELETE,
            Code::FETCH => Self::FETCH,
            Code::PATCH => Self::PATCH,
            Code::IPATCH => Self::IPATCH,
            _ => Self::empty(),
        }
    }

    /// Whether a request with `code` is accepted by this mask
    pub fn allows(self, code: Code) -> bool {
        let method = Self::for_code(code);
        !method.is_empty() && self.contains(method)
    }
}

/// Content-Format option value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentFormat(pub u16);

impl ContentFormat {
    /// text/plain; charset=utf-8
    pub const TEXT_PLAIN: ContentFormat = ContentFormat(0);
    /// application/link-format
    pub const LINK_FORMAT: ContentFormat = ContentFormat(40);
    /// application/octet-stream
    pub const OCTET_STREAM: ContentFormat = ContentFormat(42);
    /// application/json
    pub const JSON: ContentFormat = ContentFormat(50);
    /// application/cbor
    pub const CBOR: ContentFormat = ContentFormat(60);
}

/// Opaque request/response correlation bytes, at most 8
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Token {
    bytes: [u8; Token::MAX_LEN],
    len: u8,
}

impl Token {
    /// Longest token CoAP allows
    pub const MAX_LEN: usize = 8;

    /// Copy a token out of a slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > Self::MAX_LEN {
            return Err(MoteError::invalid(format!(
                "token of {} bytes exceeds {}",
                bytes.len(),
                Self::MAX_LEN
            )));
        }
        let mut token = Self::default();
        token.bytes[..bytes.len()].copy_from_slice(bytes);
        token.len = bytes.len() as u8;
        Ok(token)
    }

    /// Token bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Zero-length token
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl TryFrom<Vec<u8>> for Token {
    type Error = MoteError;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        Self::from_slice(&bytes)
    }
}

impl From<Token> for Vec<u8> {
    fn from(token: Token) -> Self {
        token.as_slice().to_vec()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_slice() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A parsed or to-be-built CoAP message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoapMessage {
    /// Message type
    pub msg_type: MessageType,
    /// Request method or response code
    pub code: Code,
    /// Message id; zero asks the codec to assign one when building
    pub msg_id: MessageId,
    /// Correlation token
    pub token: Token,
    /// Uri-Path, segments joined by '/'
    pub uri_path: Option<String>,
    /// Content-Format option
    pub content_format: Option<ContentFormat>,
    /// Payload bytes
    pub payload: Vec<u8>,
}

impl CoapMessage {
    /// A request for `uri_path` with an unassigned message id
    pub fn request(msg_type: MessageType, code: Code, uri_path: impl Into<String>) -> Self {
        Self {
            msg_type,
            code,
            msg_id: 0,
            token: Token::default(),
            uri_path: Some(uri_path.into()),
            content_format: None,
            payload: Vec::new(),
        }
    }

    /// A response carrying `code`, correlated by `msg_id` and `token`
    pub fn response(msg_type: MessageType, code: Code, msg_id: MessageId, token: Token) -> Self {
        Self {
            msg_type,
            code,
            msg_id,
            token,
            uri_path: None,
            content_format: None,
            payload: Vec::new(),
        }
    }

    /// Set the token
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = token;
        self
    }

    /// Set the message id
    pub fn with_msg_id(mut self, msg_id: MessageId) -> Self {
        self.msg_id = msg_id;
        self
    }

    /// Set the payload and its content format
    pub fn with_payload(mut self, content_format: Option<ContentFormat>, payload: Vec<u8>) -> Self {
        self.content_format = content_format;
        self.payload = payload;
        self
    }

    /// Whether the code lies in the request range
    pub fn is_request(&self) -> bool {
        self.code.is_request()
    }

    /// Empty ACK: the peer acknowledged and will answer separately
    pub fn is_empty_ack(&self) -> bool {
        self.msg_type == MessageType::Acknowledgement && self.code.is_empty()
    }

    /// Uri-Path without leading or trailing slashes
    pub fn path(&self) -> &str {
        self.uri_path
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .unwrap_or("")
    }
}

/// Result of handing inbound bytes to the codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A complete message
    Message(CoapMessage),
    /// Already seen; the codec has handled any re-acknowledgement
    Duplicate,
    /// A blockwise transfer is still in progress
    Incomplete {
        /// Block acknowledgement the codec wants transmitted back to the sender
        reply: Option<Vec<u8>>,
    },
    /// Bytes could not be parsed
    Malformed {
        /// Parser diagnostic
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_classes_and_display() {
        assert!(Code::GET.is_request());
        assert!(!Code::EMPTY.is_request());
        assert!(Code::NOT_FOUND.is_response());
        assert_eq!(Code::NOT_FOUND.to_string(), "4.04");
        assert_eq!(Code::CONTENT.raw(), 69);
        assert_eq!(Code::from_raw(0x45), Code::CONTENT);
    }

    #[test]
    fn method_mask_allows_only_requests() {
        let mask = MethodMask::GET | MethodMask::PUT;
        assert!(mask.allows(Code::GET));
        assert!(mask.allows(Code::PUT));
        assert!(!mask.allows(Code::POST));
        assert!(!MethodMask::all().allows(Code::CONTENT));
    }

    #[test]
    fn token_length_is_bounded() {
        assert!(Token::from_slice(&[0; 9]).is_err());
        let token = Token::from_slice(&[0xde, 0xad]).unwrap();
        assert_eq!(token.as_slice(), &[0xde, 0xad]);
        assert_eq!(token.to_string(), "dead");
        assert!(Token::default().is_empty());
    }

    #[test]
    fn token_deserialization_is_bounded() {
        #[derive(Debug, Deserialize)]
        struct Holder {
            token: Token,
        }

        let holder: Holder = toml::from_str("token = [222, 173]").unwrap();
        assert_eq!(holder.token.as_slice(), &[0xde, 0xad]);

        let oversized = toml::from_str::<Holder>("token = [1, 2, 3, 4, 5, 6, 7, 8, 9]");
        assert!(oversized.is_err());
    }

    #[test]
    fn path_is_normalized() {
        let msg = CoapMessage::request(MessageType::Confirmable, Code::GET, "/sensors/temp/");
        assert_eq!(msg.path(), "sensors/temp");
    }
}
