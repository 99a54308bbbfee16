// LDAP protocol handling with BER encoding/decoding.
// Implements BER parsing and generation for LDAP v3 (RFC 4511) in both
// directions: the engine decodes requests and encodes responses when acting
// as a server, and encodes requests / decodes responses when acting as a
// client.

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use std::io::{Cursor, Read};

/// OID for the StartTLS extended operation (RFC 4511).
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// OID of the notice-of-disconnection unsolicited notification (RFC 4511).
/// Sent by a server, with message id 0, without a matching request.
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// LDAP result codes used by the engine. Operation failures are carried as
/// result codes inside a normal terminal response, not as protocol errors.
pub mod result_code {
    pub const SUCCESS: i32 = 0;
    pub const OPERATIONS_ERROR: i32 = 1;
    pub const PROTOCOL_ERROR: i32 = 2;
    pub const COMPARE_FALSE: i32 = 5;
    pub const COMPARE_TRUE: i32 = 6;
    pub const INVALID_CREDENTIALS: i32 = 49;
    pub const BUSY: i32 = 51;
    pub const UNAVAILABLE: i32 = 52;
    pub const UNWILLING_TO_PERFORM: i32 = 53;
    pub const OTHER: i32 = 80;
    pub const CANCELED: i32 = 118;
}

// LDAP Control (request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub ctype: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

// LDAP Message structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(LdapResult),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    ModifyDnRequest(ModifyDnRequest),
    ModifyDnResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
}

impl ProtocolOp {
    /// Human-readable operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "BindRequest",
            ProtocolOp::BindResponse(_) => "BindResponse",
            ProtocolOp::UnbindRequest => "UnbindRequest",
            ProtocolOp::SearchRequest(_) => "SearchRequest",
            ProtocolOp::SearchResultEntry(_) => "SearchResultEntry",
            ProtocolOp::SearchResultReference(_) => "SearchResultReference",
            ProtocolOp::SearchResultDone(_) => "SearchResultDone",
            ProtocolOp::ModifyRequest(_) => "ModifyRequest",
            ProtocolOp::ModifyResponse(_) => "ModifyResponse",
            ProtocolOp::AddRequest(_) => "AddRequest",
            ProtocolOp::AddResponse(_) => "AddResponse",
            ProtocolOp::DelRequest(_) => "DelRequest",
            ProtocolOp::DelResponse(_) => "DelResponse",
            ProtocolOp::ModifyDnRequest(_) => "ModifyDnRequest",
            ProtocolOp::ModifyDnResponse(_) => "ModifyDnResponse",
            ProtocolOp::CompareRequest(_) => "CompareRequest",
            ProtocolOp::CompareResponse(_) => "CompareResponse",
            ProtocolOp::AbandonRequest(_) => "AbandonRequest",
            ProtocolOp::ExtendedRequest(_) => "ExtendedRequest",
            ProtocolOp::ExtendedResponse(_) => "ExtendedResponse",
            ProtocolOp::IntermediateResponse(_) => "IntermediateResponse",
        }
    }

    /// True for ops that terminate one operation (one response per request,
    /// or the last of many for Search).
    pub fn is_terminal_response(&self) -> bool {
        matches!(
            self,
            ProtocolOp::BindResponse(_)
                | ProtocolOp::SearchResultDone(_)
                | ProtocolOp::ModifyResponse(_)
                | ProtocolOp::AddResponse(_)
                | ProtocolOp::DelResponse(_)
                | ProtocolOp::ModifyDnResponse(_)
                | ProtocolOp::CompareResponse(_)
                | ProtocolOp::ExtendedResponse(_)
        )
    }
}

/// Common result components shared by every terminal response
/// (RFC 4511 LDAPResult).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LdapResult {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
}

impl LdapResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn new(result_code: i32, diagnostic_message: impl Into<String>) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic_message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result_code == result_code::SUCCESS
            || self.result_code == result_code::COMPARE_TRUE
            || self.result_code == result_code::COMPARE_FALSE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(String),
    Sasl { mechanism: String, credentials: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    /// Raw BER TLV of the filter. The filter grammar is opaque to the
    /// engine; it is carried through as a serializable value.
    pub filter: Vec<u8>,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    /// A minimal whole-subtree search with a `(objectClass=*)` present filter.
    pub fn subtree(base_object: impl Into<String>) -> Self {
        Self {
            base_object: base_object.into(),
            scope: SearchScope::WholeSubtree,
            deref_aliases: 0,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: present_filter("objectClass"),
            attributes: Vec::new(),
        }
    }
}

/// Build the raw TLV of a present filter: [7] IMPLICIT AttributeDescription.
pub fn present_filter(attribute: &str) -> Vec<u8> {
    let mut tlv = Vec::with_capacity(2 + attribute.len());
    tlv.push(0x87);
    tlv.push(attribute.len() as u8);
    tlv.extend_from_slice(attribute.as_bytes());
    tlv
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<u8> for SearchScope {
    type Error = anyhow::Error;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => bail!("Invalid search scope: {}", value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub entry: String,
    pub newrdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub entry: String,
    pub attr: String,
    pub assertion_value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateResponse {
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(attr_type: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        Self {
            attr_type: attr_type.into(),
            attr_values: values,
        }
    }
}

// BER parsing utilities
pub(crate) struct BerReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn read_tag(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn peek_tag(&self) -> Option<u8> {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().get(pos).copied()
    }

    fn read_length(&mut self) -> Result<usize> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        let first_byte = buf[0];

        if (first_byte & 0x80) == 0 {
            // Short form
            Ok(first_byte as usize)
        } else {
            // Long form
            let length_bytes = (first_byte & 0x7F) as usize;
            if length_bytes == 0 {
                bail!("Indefinite length not supported");
            }
            if length_bytes > 4 {
                bail!("Length too large: {} bytes", length_bytes);
            }
            if self.remaining() < length_bytes {
                bail!(
                    "BER truncated: length encoding needs {} bytes, {} remaining",
                    length_bytes,
                    self.remaining()
                );
            }
            let mut length = 0u32;
            for _ in 0..length_bytes {
                self.cursor.read_exact(&mut buf)?;
                length = (length << 8) | buf[0] as u32;
            }
            Ok(length as usize)
        }
    }

    fn read_integer(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x02 {
            bail!("Expected INTEGER tag (0x02), got: 0x{:02X}", tag);
        }
        self.read_integer_value()
    }

    /// Read length + content of an INTEGER whose tag was already consumed
    /// (IMPLICIT tagging, e.g. AbandonRequest).
    fn read_integer_value(&mut self) -> Result<i32> {
        let length = self.read_length()?;
        if length > 4 {
            bail!("Integer too large: {} bytes", length);
        }
        if self.remaining() < length {
            bail!(
                "BER truncated: integer needs {} bytes, {} remaining",
                length,
                self.remaining()
            );
        }
        let mut buf = vec![0u8; length];
        self.cursor.read_exact(&mut buf)?;

        let mut value = 0i32;
        for &byte in &buf {
            value = (value << 8) | (byte as i32);
        }

        // Sign extension for negative numbers
        if length > 0 && length < 4 && (buf[0] & 0x80) != 0 {
            value |= !0 << (length * 8);
        }

        Ok(value)
    }

    fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let tag = self.read_tag()?;
        let ok = (tag & 0x1F) == 0x04 || (0x80..=0xBF).contains(&tag);
        if !ok {
            bail!("Expected OCTET STRING tag (0x04), got: 0x{:02X}", tag);
        }
        self.read_octet_string_value()
    }

    /// Read only length + value of an OCTET STRING (tag already consumed).
    fn read_octet_string_value(&mut self) -> Result<Vec<u8>> {
        let length = self.read_length()?;
        if self.remaining() < length {
            bail!(
                "BER truncated: octet string needs {} bytes, {} remaining",
                length,
                self.remaining()
            );
        }
        let mut buf = vec![0u8; length];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).context("Invalid UTF-8 string")
    }

    fn read_string_value(&mut self) -> Result<String> {
        let bytes = self.read_octet_string_value()?;
        String::from_utf8(bytes).context("Invalid UTF-8 string")
    }

    fn read_sequence(&mut self) -> Result<usize> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x10 {
            bail!("Expected SEQUENCE tag, got: 0x{:02X}", tag);
        }
        self.read_length()
    }

    fn read_enumerated(&mut self) -> Result<u8> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x0A {
            bail!("Expected ENUMERATED tag, got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length != 1 {
            bail!("Enumerated value must be 1 byte, got: {}", length);
        }
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_boolean(&mut self) -> Result<bool> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x01 {
            bail!("Expected BOOLEAN tag, got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length != 1 {
            bail!("Boolean value must be 1 byte, got: {}", length);
        }
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0] != 0)
    }

    /// Read a complete TLV (tag, length, content) as raw bytes. Used for the
    /// search filter, which the engine carries through opaquely.
    fn read_raw_tlv(&mut self) -> Result<Vec<u8>> {
        let start = self.cursor.position() as usize;
        let _tag = self.read_tag()?;
        let length = self.read_length()?;
        if self.remaining() < length {
            bail!(
                "BER truncated: TLV needs {} content bytes, {} remaining",
                length,
                self.remaining()
            );
        }
        let content_start = self.cursor.position() as usize;
        self.cursor.set_position((content_start + length) as u64);
        let end = self.cursor.position() as usize;
        Ok(self.cursor.get_ref()[start..end].to_vec())
    }

    fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        let len = self.cursor.get_ref().len();
        len.saturating_sub(pos)
    }

    fn read_raw_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.remaining() < n {
            bail!("BER truncated: need {} bytes, {} remaining", n, self.remaining());
        }
        let mut buf = vec![0u8; n];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn position(&self) -> usize {
        self.cursor.position() as usize
    }
}

// BER encoding utilities
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl Default for BerWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            // Short form
            self.buffer.push(length as u8);
        } else {
            // Long form
            let mut bytes = Vec::new();
            let mut len = length;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer.push(0x80 | bytes.len() as u8);
            self.buffer.extend_from_slice(&bytes);
        }
    }

    fn integer_content(value: i32) -> Vec<u8> {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        // Strip redundant leading bytes while the sign bit stays intact.
        while start < 3 {
            let b = bytes[start];
            let next = bytes[start + 1];
            if (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0) {
                start += 1;
            } else {
                break;
            }
        }
        bytes[start..].to_vec()
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_tag(0x02); // INTEGER tag
        let content = Self::integer_content(value);
        self.write_length(content.len());
        self.buffer.extend_from_slice(&content);
    }

    /// Write length + content of an INTEGER under an already-written
    /// IMPLICIT tag (e.g. AbandonRequest).
    pub fn write_integer_value(&mut self, value: i32) {
        let content = Self::integer_content(value);
        self.write_length(content.len());
        self.buffer.extend_from_slice(&content);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tag(0x04); // OCTET STRING tag
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    /// OCTET STRING content under a context-specific IMPLICIT tag.
    pub fn write_tagged_octet_string(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tag(0x01); // BOOLEAN tag
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    pub fn write_enumerated(&mut self, value: u8) {
        self.write_tag(0x0A); // ENUMERATED tag
        self.write_length(1);
        self.buffer.push(value);
    }

    pub fn write_raw(&mut self, tlv: &[u8]) {
        self.buffer.extend_from_slice(tlv);
    }

    /// Start a constructed TLV under the given tag; returns the position to
    /// pass to [`Self::end_constructed`] once the content is written.
    pub fn start_constructed(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        let length_pos = self.buffer.len();
        self.buffer.push(0); // Placeholder for length
        length_pos
    }

    /// Back-patch the length of a constructed TLV. Supports short and long
    /// form; long form shifts the content right.
    pub fn end_constructed(&mut self, length_pos: usize) {
        let content_len = self.buffer.len() - (length_pos + 1);
        if content_len < 128 {
            self.buffer[length_pos] = content_len as u8;
        } else {
            let mut bytes = Vec::new();
            let mut len = content_len;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer[length_pos] = 0x80 | bytes.len() as u8;
            for (i, b) in bytes.iter().enumerate() {
                self.buffer.insert(length_pos + 1 + i, *b);
            }
        }
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start_constructed(0x30)
    }

    pub fn end_sequence(&mut self, length_pos: usize) {
        self.end_constructed(length_pos)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
/// [APPLICATION 25] constructed - intermediate response
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;

/// Context [0] IMPLICIT SEQUENCE OF control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;

/// Parse only the LDAP message header (SEQUENCE, messageID, protocolOp tag).
/// Returns (message_id, op_tag) for building error responses when the full
/// parse fails.
pub fn parse_ldap_message_header(data: &[u8]) -> Result<(i32, u8)> {
    let mut reader = BerReader::new(data);
    let _seq_len = reader.read_sequence()?;
    let message_id = reader.read_integer()?;
    let tag = reader.read_tag()?;
    Ok((message_id, tag))
}

pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut reader = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let _seq_len = reader.read_sequence()?;

    let message_id = reader.read_integer()?;

    let tag = reader.read_tag()?;
    let protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(&mut reader)?),
        LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(parse_ldap_result(&mut reader)?),
        LDAP_TAG_UNBIND_REQUEST => {
            let _len = reader.read_length()?;
            ProtocolOp::UnbindRequest
        }
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(&mut reader)?),
        LDAP_TAG_SEARCH_RESULT_ENTRY => {
            ProtocolOp::SearchResultEntry(parse_search_result_entry(&mut reader)?)
        }
        LDAP_TAG_SEARCH_RESULT_REFERENCE => {
            ProtocolOp::SearchResultReference(parse_search_result_reference(&mut reader)?)
        }
        LDAP_TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(parse_ldap_result(&mut reader)?),
        LDAP_TAG_MODIFY_REQUEST => ProtocolOp::ModifyRequest(parse_modify_request(&mut reader)?),
        LDAP_TAG_MODIFY_RESPONSE => ProtocolOp::ModifyResponse(parse_ldap_result(&mut reader)?),
        LDAP_TAG_ADD_REQUEST => ProtocolOp::AddRequest(parse_add_request(&mut reader)?),
        LDAP_TAG_ADD_RESPONSE => ProtocolOp::AddResponse(parse_ldap_result(&mut reader)?),
        LDAP_TAG_DEL_REQUEST => ProtocolOp::DelRequest(parse_del_request(&mut reader)?),
        LDAP_TAG_DEL_RESPONSE => ProtocolOp::DelResponse(parse_ldap_result(&mut reader)?),
        LDAP_TAG_MODIFY_DN_REQUEST => {
            ProtocolOp::ModifyDnRequest(parse_modify_dn_request(&mut reader)?)
        }
        LDAP_TAG_MODIFY_DN_RESPONSE => {
            ProtocolOp::ModifyDnResponse(parse_ldap_result(&mut reader)?)
        }
        LDAP_TAG_COMPARE_REQUEST => ProtocolOp::CompareRequest(parse_compare_request(&mut reader)?),
        LDAP_TAG_COMPARE_RESPONSE => ProtocolOp::CompareResponse(parse_ldap_result(&mut reader)?),
        LDAP_TAG_ABANDON_REQUEST => {
            // [APPLICATION 16] IMPLICIT MessageID (primitive)
            ProtocolOp::AbandonRequest(reader.read_integer_value()?)
        }
        LDAP_TAG_EXTENDED_REQUEST => {
            ProtocolOp::ExtendedRequest(parse_extended_request(&mut reader)?)
        }
        LDAP_TAG_EXTENDED_RESPONSE => {
            ProtocolOp::ExtendedResponse(parse_extended_response(&mut reader)?)
        }
        LDAP_TAG_INTERMEDIATE_RESPONSE => {
            ProtocolOp::IntermediateResponse(parse_intermediate_response(&mut reader)?)
        }
        _ => bail!("Unsupported LDAP operation tag: 0x{:02X}", tag),
    };

    let controls = if reader.remaining() > 0 && reader.peek_tag() == Some(LDAP_CONTEXT_CONTROLS) {
        let _tag = reader.read_tag()?;
        Some(parse_controls(&mut reader)?)
    } else {
        None
    };

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

/// Parse controls: SEQUENCE OF Control, each Control ::= SEQUENCE
/// { type, critical DEFAULT FALSE, value OPTIONAL }
fn parse_controls(reader: &mut BerReader) -> Result<Vec<Control>> {
    let seq_len = reader.read_length()?;
    let end = reader.position() + seq_len;
    let mut controls = Vec::new();
    while reader.position() < end {
        let ctrl_len = reader.read_sequence()?;
        let ctrl_end = reader.position() + ctrl_len;
        let ctype = reader.read_string()?;
        let mut critical = false;
        let mut value = None;
        while reader.position() < ctrl_end {
            let tag = reader.read_tag()?;
            if (tag & 0x1F) == 0x01 {
                let len = reader.read_length()?;
                let b = reader.read_raw_bytes(len)?;
                critical = !b.is_empty() && b[0] != 0;
            } else if (tag & 0x1F) == 0x04 {
                value = Some(reader.read_octet_string_value()?);
            } else {
                let len = reader.read_length()?;
                let _ = reader.read_raw_bytes(len)?;
            }
        }
        controls.push(Control {
            ctype,
            critical,
            value,
        });
    }
    Ok(controls)
}

fn parse_bind_request(reader: &mut BerReader) -> Result<BindRequest> {
    let _len = reader.read_length()?;
    let version = reader.read_integer()?;
    let name = reader.read_string()?;

    // Authentication: RFC 4511 simple is [0] IMPLICIT OCTET STRING (0x80).
    // Treat anything that is not SASL (0xA3) as simple bind.
    let auth_tag = reader.read_tag()?;
    let authentication = if auth_tag == 0xA3 {
        let _sasl_len = reader.read_length()?;
        let mechanism = reader.read_string()?;
        let credentials = if reader.remaining() > 0 && reader.peek_tag() == Some(0x04) {
            reader.read_octet_string()?
        } else {
            Vec::new()
        };
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        }
    } else {
        let password = reader.read_octet_string_value()?;
        BindAuthentication::Simple(String::from_utf8(password)?)
    };

    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_ldap_result(reader: &mut BerReader) -> Result<LdapResult> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let result_code = reader.read_enumerated()? as i32;
    let matched_dn = reader.read_string()?;
    let diagnostic_message = reader.read_string()?;
    // Referral [3] and any response extensions are skipped.
    if reader.position() < end {
        let skip = end - reader.position();
        let _ = reader.read_raw_bytes(skip)?;
    }
    Ok(LdapResult {
        result_code,
        matched_dn,
        diagnostic_message,
    })
}

fn parse_search_request(reader: &mut BerReader) -> Result<SearchRequest> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let base_object = reader.read_string()?;
    let scope = SearchScope::try_from(reader.read_enumerated()?)?;
    let deref_aliases = reader.read_enumerated()? as i32;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;

    // Filter: opaque TLV, carried through unparsed.
    let filter = reader.read_raw_tlv()?;

    // Attributes: SEQUENCE OF LDAPString
    let attrs_len = reader.read_sequence()?;
    let attrs_end = reader.position() + attrs_len;
    let mut attributes = Vec::new();
    while reader.position() < attrs_end && reader.position() < end {
        attributes.push(reader.read_string()?);
    }

    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn parse_search_result_entry(reader: &mut BerReader) -> Result<SearchResultEntry> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let object_name = reader.read_string()?;
    let attrs_len = reader.read_sequence()?;
    let attrs_end = reader.position() + attrs_len;
    let mut attributes = Vec::new();
    while reader.position() < attrs_end && reader.position() < end {
        attributes.push(parse_attribute(reader)?);
    }
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

fn parse_search_result_reference(reader: &mut BerReader) -> Result<Vec<String>> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let mut uris = Vec::new();
    while reader.position() < end {
        uris.push(reader.read_string()?);
    }
    Ok(uris)
}

fn parse_modify_request(reader: &mut BerReader) -> Result<ModifyRequest> {
    let _len = reader.read_length()?;
    let object = reader.read_string()?;

    let changes_len = reader.read_sequence()?;
    let changes_end = reader.position() + changes_len;
    let mut changes = Vec::new();

    while reader.position() < changes_end {
        let _change_seq = reader.read_sequence()?;
        let operation = reader.read_enumerated()?;
        let modification = parse_attribute(reader)?;

        changes.push(ModifyChange {
            operation: match operation {
                0 => ModifyOperation::Add,
                1 => ModifyOperation::Delete,
                2 => ModifyOperation::Replace,
                _ => bail!("Invalid modify operation: {}", operation),
            },
            modification,
        });
    }

    Ok(ModifyRequest { object, changes })
}

fn parse_add_request(reader: &mut BerReader) -> Result<AddRequest> {
    let _len = reader.read_length()?;
    let entry = reader.read_string()?;

    let attrs_len = reader.read_sequence()?;
    let attrs_end = reader.position() + attrs_len;
    let mut attributes = Vec::new();

    while reader.position() < attrs_end {
        attributes.push(parse_attribute(reader)?);
    }

    Ok(AddRequest { entry, attributes })
}

/// DelRequest ::= [APPLICATION 10] LDAPDN - primitive, content is the DN.
fn parse_del_request(reader: &mut BerReader) -> Result<DelRequest> {
    let len = reader.read_length()?;
    let bytes = reader.read_raw_bytes(len)?;
    Ok(DelRequest {
        entry: String::from_utf8(bytes).context("Invalid UTF-8 DN")?,
    })
}

/// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE
/// { entry, newrdn, deleteoldrdn, newSuperior [0] OPTIONAL }
fn parse_modify_dn_request(reader: &mut BerReader) -> Result<ModifyDnRequest> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let entry = reader.read_string()?;
    let newrdn = reader.read_string()?;
    let delete_old_rdn = reader.read_boolean()?;
    let new_superior = if reader.position() < end {
        let tag = reader.read_tag()?;
        if tag != 0x80 {
            bail!("ModifyDnRequest: expected newSuperior [0], got tag 0x{:02X}", tag);
        }
        Some(reader.read_string_value()?)
    } else {
        None
    };
    Ok(ModifyDnRequest {
        entry,
        newrdn,
        delete_old_rdn,
        new_superior,
    })
}

/// CompareRequest ::= [APPLICATION 14] SEQUENCE { entry, ava AttributeValueAssertion }
fn parse_compare_request(reader: &mut BerReader) -> Result<CompareRequest> {
    let _len = reader.read_length()?;
    let entry = reader.read_string()?;
    let _ava_len = reader.read_sequence()?;
    let attr = reader.read_string()?;
    let assertion_value = reader.read_octet_string()?;
    Ok(CompareRequest {
        entry,
        attr,
        assertion_value,
    })
}

fn parse_extended_request(reader: &mut BerReader) -> Result<ExtendedRequest> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let tag = reader.read_tag()?;
    if tag != 0x80 {
        bail!("ExtendedRequest: expected requestName [0], got tag 0x{:02X}", tag);
    }
    let request_name = reader.read_string_value()?;
    let request_value = if reader.position() < end {
        let tag = reader.read_tag()?;
        if tag != 0x81 {
            bail!("ExtendedRequest: expected requestValue [1], got tag 0x{:02X}", tag);
        }
        Some(reader.read_octet_string_value()?)
    } else {
        None
    };
    Ok(ExtendedRequest {
        request_name,
        request_value,
    })
}

fn parse_extended_response(reader: &mut BerReader) -> Result<ExtendedResponse> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let result_code = reader.read_enumerated()? as i32;
    let matched_dn = reader.read_string()?;
    let diagnostic_message = reader.read_string()?;
    let mut response_name = None;
    let mut response_value = None;
    while reader.position() < end {
        let tag = reader.read_tag()?;
        match tag {
            0x8A => response_name = Some(reader.read_string_value()?),
            0x8B => response_value = Some(reader.read_octet_string_value()?),
            _ => {
                // Referral or unknown extension: skip its TLV content.
                let len = reader.read_length()?;
                let _ = reader.read_raw_bytes(len)?;
            }
        }
    }
    Ok(ExtendedResponse {
        result: LdapResult {
            result_code,
            matched_dn,
            diagnostic_message,
        },
        response_name,
        response_value,
    })
}

fn parse_intermediate_response(reader: &mut BerReader) -> Result<IntermediateResponse> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let mut response_name = None;
    let mut response_value = None;
    while reader.position() < end {
        let tag = reader.read_tag()?;
        match tag {
            0x80 => response_name = Some(reader.read_string_value()?),
            0x81 => response_value = Some(reader.read_octet_string_value()?),
            _ => bail!("IntermediateResponse: unexpected tag 0x{:02X}", tag),
        }
    }
    Ok(IntermediateResponse {
        response_name,
        response_value,
    })
}

fn parse_attribute(reader: &mut BerReader) -> Result<Attribute> {
    let _seq_len = reader.read_sequence()?;
    let attr_type = reader.read_string()?;

    // vals: SET OF (0x31); accept SEQUENCE (0x30) from lenient encoders.
    let vals_tag = reader.read_tag()?;
    if vals_tag != 0x31 && vals_tag != 0x30 {
        bail!("Attribute: expected SET of values, got tag 0x{:02X}", vals_tag);
    }
    let vals_len = reader.read_length()?;
    let vals_end = reader.position() + vals_len;
    let mut attr_values = Vec::new();

    while reader.position() < vals_end {
        attr_values.push(reader.read_octet_string()?);
    }

    Ok(Attribute {
        attr_type,
        attr_values,
    })
}

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();

    writer.write_integer(message.message_id);

    match &message.protocol_op {
        ProtocolOp::BindRequest(req) => encode_bind_request(&mut writer, req),
        ProtocolOp::BindResponse(r) => encode_result(&mut writer, LDAP_TAG_BIND_RESPONSE, r),
        ProtocolOp::UnbindRequest => {
            writer.write_tag(LDAP_TAG_UNBIND_REQUEST);
            writer.write_length(0);
        }
        ProtocolOp::SearchRequest(req) => encode_search_request(&mut writer, req),
        ProtocolOp::SearchResultEntry(entry) => encode_search_result_entry(&mut writer, entry),
        ProtocolOp::SearchResultReference(uris) => {
            let pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_REFERENCE);
            for uri in uris {
                writer.write_string(uri);
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::SearchResultDone(r) => {
            encode_result(&mut writer, LDAP_TAG_SEARCH_RESULT_DONE, r)
        }
        ProtocolOp::ModifyRequest(req) => encode_modify_request(&mut writer, req),
        ProtocolOp::ModifyResponse(r) => encode_result(&mut writer, LDAP_TAG_MODIFY_RESPONSE, r),
        ProtocolOp::AddRequest(req) => encode_add_request(&mut writer, req),
        ProtocolOp::AddResponse(r) => encode_result(&mut writer, LDAP_TAG_ADD_RESPONSE, r),
        ProtocolOp::DelRequest(req) => {
            writer.write_tagged_octet_string(LDAP_TAG_DEL_REQUEST, req.entry.as_bytes());
        }
        ProtocolOp::DelResponse(r) => encode_result(&mut writer, LDAP_TAG_DEL_RESPONSE, r),
        ProtocolOp::ModifyDnRequest(req) => encode_modify_dn_request(&mut writer, req),
        ProtocolOp::ModifyDnResponse(r) => {
            encode_result(&mut writer, LDAP_TAG_MODIFY_DN_RESPONSE, r)
        }
        ProtocolOp::CompareRequest(req) => encode_compare_request(&mut writer, req),
        ProtocolOp::CompareResponse(r) => encode_result(&mut writer, LDAP_TAG_COMPARE_RESPONSE, r),
        ProtocolOp::AbandonRequest(id) => {
            writer.write_tag(LDAP_TAG_ABANDON_REQUEST);
            writer.write_integer_value(*id);
        }
        ProtocolOp::ExtendedRequest(req) => encode_extended_request(&mut writer, req),
        ProtocolOp::ExtendedResponse(resp) => encode_extended_response(&mut writer, resp),
        ProtocolOp::IntermediateResponse(resp) => encode_intermediate_response(&mut writer, resp),
    }

    if let Some(controls) = &message.controls {
        let pos = writer.start_constructed(LDAP_CONTEXT_CONTROLS);
        for control in controls {
            let ctrl = writer.start_sequence();
            writer.write_string(&control.ctype);
            if control.critical {
                writer.write_boolean(true);
            }
            if let Some(value) = &control.value {
                writer.write_octet_string(value);
            }
            writer.end_sequence(ctrl);
        }
        writer.end_constructed(pos);
    }

    writer.end_sequence(seq_start);
    Ok(writer.into_vec())
}

fn encode_result(writer: &mut BerWriter, tag: u8, result: &LdapResult) {
    let pos = writer.start_constructed(tag);
    writer.write_enumerated(result.result_code as u8);
    writer.write_string(&result.matched_dn);
    writer.write_string(&result.diagnostic_message);
    writer.end_constructed(pos);
}

fn encode_bind_request(writer: &mut BerWriter, req: &BindRequest) {
    let pos = writer.start_constructed(LDAP_TAG_BIND_REQUEST);
    writer.write_integer(req.version);
    writer.write_string(&req.name);
    match &req.authentication {
        BindAuthentication::Simple(password) => {
            writer.write_tagged_octet_string(0x80, password.as_bytes());
        }
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        } => {
            let sasl = writer.start_constructed(0xA3);
            writer.write_string(mechanism);
            if !credentials.is_empty() {
                writer.write_octet_string(credentials);
            }
            writer.end_constructed(sasl);
        }
    }
    writer.end_constructed(pos);
}

fn encode_search_request(writer: &mut BerWriter, req: &SearchRequest) {
    let pos = writer.start_constructed(LDAP_TAG_SEARCH_REQUEST);
    writer.write_string(&req.base_object);
    writer.write_enumerated(req.scope as u8);
    writer.write_enumerated(req.deref_aliases as u8);
    writer.write_integer(req.size_limit);
    writer.write_integer(req.time_limit);
    writer.write_boolean(req.types_only);
    writer.write_raw(&req.filter);
    let attrs = writer.start_sequence();
    for attr in &req.attributes {
        writer.write_string(attr);
    }
    writer.end_sequence(attrs);
    writer.end_constructed(pos);
}

fn encode_search_result_entry(writer: &mut BerWriter, entry: &SearchResultEntry) {
    let pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_ENTRY);
    writer.write_string(&entry.object_name);
    let attrs = writer.start_sequence();
    for attr in &entry.attributes {
        encode_attribute(writer, attr);
    }
    writer.end_sequence(attrs);
    writer.end_constructed(pos);
}

fn encode_modify_request(writer: &mut BerWriter, req: &ModifyRequest) {
    let pos = writer.start_constructed(LDAP_TAG_MODIFY_REQUEST);
    writer.write_string(&req.object);
    let changes = writer.start_sequence();
    for change in &req.changes {
        let one = writer.start_sequence();
        writer.write_enumerated(change.operation as u8);
        encode_attribute(writer, &change.modification);
        writer.end_sequence(one);
    }
    writer.end_sequence(changes);
    writer.end_constructed(pos);
}

fn encode_add_request(writer: &mut BerWriter, req: &AddRequest) {
    let pos = writer.start_constructed(LDAP_TAG_ADD_REQUEST);
    writer.write_string(&req.entry);
    let attrs = writer.start_sequence();
    for attr in &req.attributes {
        encode_attribute(writer, attr);
    }
    writer.end_sequence(attrs);
    writer.end_constructed(pos);
}

fn encode_modify_dn_request(writer: &mut BerWriter, req: &ModifyDnRequest) {
    let pos = writer.start_constructed(LDAP_TAG_MODIFY_DN_REQUEST);
    writer.write_string(&req.entry);
    writer.write_string(&req.newrdn);
    writer.write_boolean(req.delete_old_rdn);
    if let Some(superior) = &req.new_superior {
        writer.write_tagged_octet_string(0x80, superior.as_bytes());
    }
    writer.end_constructed(pos);
}

fn encode_compare_request(writer: &mut BerWriter, req: &CompareRequest) {
    let pos = writer.start_constructed(LDAP_TAG_COMPARE_REQUEST);
    writer.write_string(&req.entry);
    let ava = writer.start_sequence();
    writer.write_string(&req.attr);
    writer.write_octet_string(&req.assertion_value);
    writer.end_sequence(ava);
    writer.end_constructed(pos);
}

fn encode_extended_request(writer: &mut BerWriter, req: &ExtendedRequest) {
    let pos = writer.start_constructed(LDAP_TAG_EXTENDED_REQUEST);
    writer.write_tagged_octet_string(0x80, req.request_name.as_bytes());
    if let Some(value) = &req.request_value {
        writer.write_tagged_octet_string(0x81, value);
    }
    writer.end_constructed(pos);
}

fn encode_extended_response(writer: &mut BerWriter, resp: &ExtendedResponse) {
    let pos = writer.start_constructed(LDAP_TAG_EXTENDED_RESPONSE);
    writer.write_enumerated(resp.result.result_code as u8);
    writer.write_string(&resp.result.matched_dn);
    writer.write_string(&resp.result.diagnostic_message);
    if let Some(name) = &resp.response_name {
        writer.write_tagged_octet_string(0x8A, name.as_bytes());
    }
    if let Some(value) = &resp.response_value {
        writer.write_tagged_octet_string(0x8B, value);
    }
    writer.end_constructed(pos);
}

fn encode_intermediate_response(writer: &mut BerWriter, resp: &IntermediateResponse) {
    let pos = writer.start_constructed(LDAP_TAG_INTERMEDIATE_RESPONSE);
    if let Some(name) = &resp.response_name {
        writer.write_tagged_octet_string(0x80, name.as_bytes());
    }
    if let Some(value) = &resp.response_value {
        writer.write_tagged_octet_string(0x81, value);
    }
    writer.end_constructed(pos);
}

fn encode_attribute(writer: &mut BerWriter, attr: &Attribute) {
    let seq = writer.start_sequence();
    writer.write_string(&attr.attr_type);
    let vals = writer.start_constructed(0x31); // SET OF
    for value in &attr.attr_values {
        writer.write_octet_string(value);
    }
    writer.end_constructed(vals);
    writer.end_sequence(seq);
}

/// Map a request op tag to the tag of its terminal response, for building
/// error responses when the full message could not be parsed.
pub fn response_tag_for_request(request_tag: u8) -> u8 {
    match request_tag {
        LDAP_TAG_BIND_REQUEST => LDAP_TAG_BIND_RESPONSE,
        LDAP_TAG_SEARCH_REQUEST => LDAP_TAG_SEARCH_RESULT_DONE,
        LDAP_TAG_MODIFY_REQUEST => LDAP_TAG_MODIFY_RESPONSE,
        LDAP_TAG_ADD_REQUEST => LDAP_TAG_ADD_RESPONSE,
        LDAP_TAG_DEL_REQUEST => LDAP_TAG_DEL_RESPONSE,
        LDAP_TAG_MODIFY_DN_REQUEST => LDAP_TAG_MODIFY_DN_RESPONSE,
        LDAP_TAG_COMPARE_REQUEST => LDAP_TAG_COMPARE_RESPONSE,
        LDAP_TAG_EXTENDED_REQUEST => LDAP_TAG_EXTENDED_RESPONSE,
        // fallback so we can still send an error
        _ => LDAP_TAG_BIND_RESPONSE,
    }
}

/// Encode a bare error response with the given response tag.
pub fn encode_error_response(
    message_id: i32,
    response_tag: u8,
    result_code: i32,
    matched_dn: &str,
    diagnostic_message: &str,
) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();
    writer.write_integer(message_id);
    encode_result(
        &mut writer,
        response_tag,
        &LdapResult {
            result_code,
            matched_dn: matched_dn.to_string(),
            diagnostic_message: diagnostic_message.to_string(),
        },
    );
    writer.end_sequence(seq_start);
    Ok(writer.into_vec())
}

/// Top-level LDAP message is always a SEQUENCE (BER tag 0x30).
const LDAP_MESSAGE_SEQUENCE_TAG: u8 = 0x30;

/// Length of the complete frame starting at buf[0], if the header is whole.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let len_byte = buf[1];
    if (len_byte & 0x80) == 0 {
        return Ok(Some(2 + len_byte as usize));
    }
    let length_bytes = (len_byte & 0x7F) as usize;
    if length_bytes == 0 || length_bytes > 4 {
        bail!("Unsupported BER length encoding: 0x{:02X}", len_byte);
    }
    if buf.len() < 2 + length_bytes {
        return Ok(None);
    }
    let mut length = 0usize;
    for i in 0..length_bytes {
        length = (length << 8) | buf[2 + i] as usize;
    }
    Ok(Some(2 + length_bytes + length))
}

/// Result of trying to parse one LDAP message from the buffer.
pub enum TryParseResult {
    /// Not enough data yet.
    Incomplete,
    /// Successfully parsed message; raw frame bytes included.
    Message { message: LdapMessage, raw: Vec<u8> },
    /// Parse failed; `consume` bytes were discarded. Respond with a
    /// protocolError carrying `response_tag` for `message_id`.
    ParseError {
        message_id: i32,
        response_tag: u8,
        consume: usize,
    },
}

/// Try to extract one complete LDAP message from the front of `buffer`,
/// consuming its bytes on success or on an unrecoverable frame.
pub fn try_parse_message(buffer: &mut BytesMut) -> Result<TryParseResult> {
    if buffer.len() < 2 {
        return Ok(TryParseResult::Incomplete);
    }

    if buffer[0] != LDAP_MESSAGE_SEQUENCE_TAG {
        // Not the start of an LDAPMessage: either invalid client data or
        // the remainder of a message after a framing error.
        bail!("Stream does not start with SEQUENCE: 0x{:02X}", buffer[0]);
    }

    let total = match frame_length(&buffer[..])? {
        Some(t) => t,
        None => return Ok(TryParseResult::Incomplete),
    };
    if buffer.len() < total {
        return Ok(TryParseResult::Incomplete);
    }

    let frame = &buffer[..total];
    match parse_ldap_message(frame) {
        Ok(message) => {
            let raw = frame.to_vec();
            let _ = buffer.split_to(total);
            Ok(TryParseResult::Message { message, raw })
        }
        Err(_) => {
            let (message_id, request_tag) = parse_ldap_message_header(frame).unwrap_or((0, 0x60));
            let _ = buffer.split_to(total);
            Ok(TryParseResult::ParseError {
                message_id,
                response_tag: response_tag_for_request(request_tag),
                consume: total,
            })
        }
    }
}
