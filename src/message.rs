//! LDAPv3 message layer (RFC 4511 subset): the LDAPMessage envelope and
//! the protocol-op records carried inside it.
//!
//! Every envelope is encoded and decoded with the codec-global implicit
//! flag on, so `[APPLICATION n]` tags replace the natural SEQUENCE tag
//! inline.

use std::collections::HashMap;
use std::io::Read;

use crate::asn1::decode::FromBer;
use crate::asn1::encode::{encode_field, int_content, ToBer};
use crate::asn1::{
    BerError, Class, Decoder, Encoder, FieldOptions, Ident, RawValue, TAG_ENUMERATED, TAG_INTEGER,
    TAG_SEQUENCE,
};
use crate::filter::Filter;

pub const LDAP_VERSION: i8 = 3;

/// OID of the StartTLS extended operation (RFC 4511 §4.14).
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";

// protocolOp application tags (RFC 4511 §4.2-4.12).
pub const APP_BIND_REQUEST: u32 = 0;
pub const APP_BIND_RESPONSE: u32 = 1;
pub const APP_UNBIND_REQUEST: u32 = 2;
pub const APP_SEARCH_REQUEST: u32 = 3;
pub const APP_SEARCH_RESULT_ENTRY: u32 = 4;
pub const APP_SEARCH_RESULT_DONE: u32 = 5;
pub const APP_SEARCH_RESULT_REFERENCE: u32 = 19;
pub const APP_EXTENDED_REQUEST: u32 = 23;
pub const APP_EXTENDED_RESPONSE: u32 = 24;

// Result codes.
pub const RESULT_SUCCESS: i32 = 0;
pub const RESULT_INAPPROPRIATE_AUTHENTICATION: i32 = 48;
pub const RESULT_INVALID_CREDENTIALS: i32 = 49;
pub const RESULT_INSUFFICIENT_ACCESS_RIGHTS: i32 = 59;

/// LDAPResult ::= SEQUENCE { resultCode ENUMERATED, matchedDN, diagnosticMessage, referral [3] OPTIONAL }
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LdapResult {
    pub result_code: i32,
    pub matched_dn: Vec<u8>,
    pub diagnostic_message: Vec<u8>,
    pub referral: Vec<Vec<u8>>,
}

impl LdapResult {
    fn fields<R: Read>(dec: &mut Decoder<R>) -> Result<Self, BerError> {
        Ok(LdapResult {
            result_code: dec.field(FieldOptions::parse("enum")?)?,
            matched_dn: dec.field(FieldOptions::default())?,
            diagnostic_message: dec.field(FieldOptions::default())?,
            referral: dec.field(FieldOptions::parse("tag:3,optional")?)?,
        })
    }

    pub fn diagnostic(&self) -> String {
        String::from_utf8_lossy(&self.diagnostic_message).into_owned()
    }
}

impl FromBer for LdapResult {
    fn from_ber<R: Read>(dec: &mut Decoder<R>, opts: FieldOptions) -> Result<Self, BerError> {
        dec.constructed(opts, TAG_SEQUENCE, |dec, _| Self::fields(dec))
    }

    fn from_ber_components<R: Read>(dec: &mut Decoder<R>) -> Result<Self, BerError> {
        Self::fields(dec)
    }
}

/// BindRequest ::= [APPLICATION 0] SEQUENCE { version, name, authentication }
///
/// Only the simple authentication choice is supported: `[0]` password
/// octets.
#[derive(Debug, Clone)]
pub(crate) struct BindRequest {
    pub version: i8,
    pub name: Vec<u8>,
    pub password: Vec<u8>,
}

impl ToBer for BindRequest {
    fn ber_ident(&self, _opts: &FieldOptions) -> Ident {
        Ident::constructed(Class::Universal, TAG_SEQUENCE)
    }
    fn ber_content(&self, implicit: bool) -> Result<Vec<u8>, BerError> {
        let mut out = Vec::new();
        encode_field(&mut out, &self.version, FieldOptions::default(), implicit)?;
        encode_field(&mut out, &self.name, FieldOptions::default(), implicit)?;
        encode_field(&mut out, &self.password, FieldOptions::parse("tag:0")?, implicit)?;
        Ok(out)
    }
    fn is_zero(&self) -> bool {
        false
    }
}

/// Search scope (RFC 4511 §4.5.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchScope {
    #[default]
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

/// Alias dereferencing policy (RFC 4511 §4.5.1.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerefAliases {
    #[default]
    NeverDerefAliases = 0,
    DerefInSearching = 1,
    DerefFindingBaseObj = 2,
    DerefAlways = 3,
}

macro_rules! impl_to_ber_enum {
    ($($t:ty),+) => {$(
        impl ToBer for $t {
            fn ber_ident(&self, opts: &FieldOptions) -> Ident {
                let tag = if opts.enumerated { TAG_ENUMERATED } else { TAG_INTEGER };
                Ident::primitive(Class::Universal, tag)
            }
            fn ber_content(&self, _implicit: bool) -> Result<Vec<u8>, BerError> {
                Ok(int_content(*self as i64))
            }
            fn is_zero(&self) -> bool {
                *self as i64 == 0
            }
        }
    )+};
}

impl_to_ber_enum!(SearchScope, DerefAliases);

/// SearchRequest ::= [APPLICATION 3] SEQUENCE { baseObject, scope, derefAliases,
/// sizeLimit, timeLimit, typesOnly, filter, attributes }
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(base_object: &str, filter: Filter) -> SearchRequest {
        SearchRequest {
            base_object: base_object.to_string(),
            scope: SearchScope::WholeSubtree,
            deref_aliases: DerefAliases::NeverDerefAliases,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter,
            attributes: Vec::new(),
        }
    }
}

impl ToBer for SearchRequest {
    fn ber_ident(&self, _opts: &FieldOptions) -> Ident {
        Ident::constructed(Class::Universal, TAG_SEQUENCE)
    }
    fn ber_content(&self, implicit: bool) -> Result<Vec<u8>, BerError> {
        let mut out = Vec::new();
        encode_field(&mut out, &self.base_object, FieldOptions::default(), implicit)?;
        encode_field(&mut out, &self.scope, FieldOptions::parse("enum")?, implicit)?;
        encode_field(&mut out, &self.deref_aliases, FieldOptions::parse("enum")?, implicit)?;
        encode_field(&mut out, &self.size_limit, FieldOptions::default(), implicit)?;
        encode_field(&mut out, &self.time_limit, FieldOptions::default(), implicit)?;
        encode_field(&mut out, &self.types_only, FieldOptions::default(), implicit)?;
        encode_field(&mut out, &self.filter, FieldOptions::default(), implicit)?;
        encode_field(&mut out, &self.attributes, FieldOptions::default(), implicit)?;
        Ok(out)
    }
    fn is_zero(&self) -> bool {
        false
    }
}

/// SearchResultEntry ::= [APPLICATION 4] SEQUENCE { objectName, attributes }
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct SearchResultEntry {
    pub name: Vec<u8>,
    pub attributes: Vec<PartialAttribute>,
}

impl FromBer for SearchResultEntry {
    fn from_ber<R: Read>(dec: &mut Decoder<R>, opts: FieldOptions) -> Result<Self, BerError> {
        dec.constructed(opts, TAG_SEQUENCE, |dec, _| {
            Ok(SearchResultEntry {
                name: dec.field(FieldOptions::default())?,
                attributes: dec.field(FieldOptions::default())?,
            })
        })
    }
}

/// PartialAttribute ::= SEQUENCE { type, vals SET OF value }
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct PartialAttribute {
    pub attr_type: Vec<u8>,
    pub values: Vec<Vec<u8>>,
}

impl FromBer for PartialAttribute {
    fn from_ber<R: Read>(dec: &mut Decoder<R>, opts: FieldOptions) -> Result<Self, BerError> {
        dec.constructed(opts, TAG_SEQUENCE, |dec, _| {
            Ok(PartialAttribute {
                attr_type: dec.field(FieldOptions::default())?,
                values: dec.field(FieldOptions::parse("set")?)?,
            })
        })
    }
}

impl FromBer for Vec<PartialAttribute> {
    fn from_ber<R: Read>(dec: &mut Decoder<R>, opts: FieldOptions) -> Result<Self, BerError> {
        dec.sequence_of::<PartialAttribute>(opts)
    }
}

/// One entry of a search result, with attribute values as UTF-8 strings
/// (lossily converted).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchResult {
    pub dn: String,
    pub attributes: HashMap<String, Vec<String>>,
}

impl From<SearchResultEntry> for SearchResult {
    fn from(entry: SearchResultEntry) -> SearchResult {
        let mut attributes = HashMap::with_capacity(entry.attributes.len());
        for attr in entry.attributes {
            let values = attr
                .values
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect();
            attributes.insert(
                String::from_utf8_lossy(&attr.attr_type).into_owned(),
                values,
            );
        }
        SearchResult {
            dn: String::from_utf8_lossy(&entry.name).into_owned(),
            attributes,
        }
    }
}

/// ExtendedRequest ::= [APPLICATION 23] SEQUENCE { requestName [0], requestValue [1] OPTIONAL }
#[derive(Debug, Clone)]
pub(crate) struct ExtendedRequest {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl ToBer for ExtendedRequest {
    fn ber_ident(&self, _opts: &FieldOptions) -> Ident {
        Ident::constructed(Class::Universal, TAG_SEQUENCE)
    }
    fn ber_content(&self, implicit: bool) -> Result<Vec<u8>, BerError> {
        let mut out = Vec::new();
        encode_field(&mut out, &self.name, FieldOptions::parse("tag:0")?, implicit)?;
        encode_field(&mut out, &self.value, FieldOptions::parse("tag:1,optional")?, implicit)?;
        Ok(out)
    }
    fn is_zero(&self) -> bool {
        false
    }
}

/// ExtendedResponse ::= [APPLICATION 24] SEQUENCE { COMPONENTS OF LDAPResult,
/// responseName [10] OPTIONAL, responseValue [11] OPTIONAL }
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct ExtendedResponse {
    pub result: LdapResult,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl FromBer for ExtendedResponse {
    fn from_ber<R: Read>(dec: &mut Decoder<R>, opts: FieldOptions) -> Result<Self, BerError> {
        dec.constructed(opts, TAG_SEQUENCE, |dec, _| {
            Ok(ExtendedResponse {
                result: dec.field(FieldOptions::parse("components")?)?,
                name: dec.field(FieldOptions::parse("tag:10,optional")?)?,
                value: dec.field(FieldOptions::parse("tag:11,optional")?)?,
            })
        })
    }
}

/// LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
pub(crate) struct Envelope<'a, T: ToBer> {
    pub message_id: i64,
    pub op: &'a T,
    pub op_opts: FieldOptions,
    pub controls: Vec<RawValue>,
}

impl<T: ToBer> ToBer for Envelope<'_, T> {
    fn ber_ident(&self, _opts: &FieldOptions) -> Ident {
        Ident::constructed(Class::Universal, TAG_SEQUENCE)
    }
    fn ber_content(&self, implicit: bool) -> Result<Vec<u8>, BerError> {
        let mut out = Vec::new();
        encode_field(&mut out, &self.message_id, FieldOptions::default(), implicit)?;
        encode_field(&mut out, self.op, self.op_opts, implicit)?;
        encode_field(&mut out, &self.controls, FieldOptions::parse("tag:0,optional")?, implicit)?;
        Ok(out)
    }
    fn is_zero(&self) -> bool {
        false
    }
}

/// Serialises one LDAPMessage with implicit tagging enabled.
pub(crate) fn encode_message<T: ToBer>(
    message_id: i64,
    op: &T,
    op_opts: FieldOptions,
) -> Result<Vec<u8>, BerError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.implicit = true;
    enc.encode(&Envelope {
        message_id,
        op,
        op_opts,
        controls: Vec::new(),
    })?;
    Ok(buf)
}

/// Decodes one LDAPMessage with implicit tagging enabled, binding the
/// protocolOp with `op_opts`. Controls are captured as raw values for the
/// caller to interpret.
pub(crate) fn decode_message<T: FromBer + Default>(
    buf: &[u8],
    op_opts: FieldOptions,
) -> Result<(i64, T, Vec<RawValue>), BerError> {
    let mut dec = Decoder::new(buf);
    dec.implicit = true;
    dec.constructed(FieldOptions::default(), TAG_SEQUENCE, |dec, _| {
        let message_id: i64 = dec.field(FieldOptions::default())?;
        let op: T = dec.field(op_opts)?;
        let controls: Vec<RawValue> = dec.field(FieldOptions::parse("tag:0,optional")?)?;
        Ok((message_id, op, controls))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(s: &str) -> FieldOptions {
        FieldOptions::parse(s).unwrap()
    }

    #[test]
    fn test_encode_bind_request_message() {
        // SEQUENCE { messageID 0, [APPLICATION 0] { version 3, "u", [0] "p" } }
        // bind content: 3 + 3 + 3 = 9; outer content: 3 + 2 + 9 = 14 (0x0e).
        let req = BindRequest {
            version: LDAP_VERSION,
            name: b"u".to_vec(),
            password: b"p".to_vec(),
        };
        let buf = encode_message(0, &req, opts("application,tag:0")).unwrap();
        assert_eq!(
            buf,
            [
                0x30, 0x0e, // LDAPMessage
                0x02, 0x01, 0x00, // messageID 0
                0x60, 0x09, // [APPLICATION 0] BindRequest
                0x02, 0x01, 0x03, // version 3
                0x04, 0x01, b'u', // name
                0x80, 0x01, b'p', // [0] simple password
            ]
        );
    }

    #[test]
    fn test_encode_unbind_message() {
        // UnbindRequest is the universal NULL re-tagged [APPLICATION 2].
        let op = RawValue {
            class: Class::Universal,
            tag: crate::asn1::TAG_NULL,
            ..RawValue::default()
        };
        let buf = encode_message(1, &op, opts("application,tag:2")).unwrap();
        assert_eq!(buf, [0x30, 0x05, 0x02, 0x01, 0x01, 0x42, 0x00]);
    }

    #[test]
    fn test_decode_bind_response() {
        // SEQUENCE { messageID 0, [APPLICATION 1] { ENUM 0, "", "" } }
        let buf = [
            0x30, 0x0c, 0x02, 0x01, 0x00, 0x61, 0x07, 0x0a, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00,
        ];
        let (id, result, controls): (i64, LdapResult, Vec<RawValue>) =
            decode_message(&buf, opts("application,tag:1")).unwrap();
        assert_eq!(id, 0);
        assert_eq!(result.result_code, RESULT_SUCCESS);
        assert!(result.matched_dn.is_empty());
        assert!(result.referral.is_empty());
        assert!(controls.is_empty());
    }

    #[test]
    fn test_decode_bind_response_with_referral() {
        // referral [3] { "ldap://x" } after the diagnostic message.
        let buf = [
            0x30, 0x18, 0x02, 0x01, 0x02, 0x61, 0x13, //
            0x0a, 0x01, 0x0a, // resultCode 10 (referral)
            0x04, 0x00, 0x04, 0x00, //
            0xa3, 0x0a, 0x04, 0x08, b'l', b'd', b'a', b'p', b':', b'/', b'/', b'x',
        ];
        let (_, result, _): (i64, LdapResult, Vec<RawValue>) =
            decode_message(&buf, opts("application,tag:1")).unwrap();
        assert_eq!(result.result_code, 10);
        assert_eq!(result.referral, vec![b"ldap://x".to_vec()]);
    }

    #[test]
    fn test_decode_envelope_with_raw_op() {
        // protocolOp bound to RawValue defers decoding; raw_bytes feeds a
        // second pass with the tag-specific options.
        let buf = [
            0x30, 0x0c, 0x02, 0x01, 0x05, 0x64, 0x07, 0x04, 0x02, b'd', b'c', 0x30, 0x01, 0x99,
        ];
        let (id, raw, _): (i64, RawValue, Vec<RawValue>) =
            decode_message(&buf, FieldOptions::default()).unwrap();
        assert_eq!(id, 5);
        assert_eq!(raw.class, Class::Application);
        assert_eq!(raw.tag, APP_SEARCH_RESULT_ENTRY);
        assert!(raw.constructed);
        assert_eq!(raw.raw_bytes[0], 0x64);
    }

    #[test]
    fn test_decode_search_result_entry() {
        // [APPLICATION 4] { "cn=a", { { "cn", SET { "a" } } } }
        // partial attribute: 04 02 "cn" + 31 03 { 04 01 "a" } = 4 + 5 = 9;
        // attribute list: 30 0b; entry content: 6 + 13 = 19 (0x13).
        let buf = [
            0x64, 0x13, //
            0x04, 0x04, b'c', b'n', b'=', b'a', //
            0x30, 0x0b, //
            0x30, 0x09, //
            0x04, 0x02, b'c', b'n', //
            0x31, 0x03, 0x04, 0x01, b'a',
        ];
        let mut dec = Decoder::new(&buf[..]);
        dec.implicit = true;
        let entry: SearchResultEntry = dec.decode_with(opts("application,tag:4")).unwrap();
        assert_eq!(entry.name, b"cn=a");
        assert_eq!(entry.attributes.len(), 1);
        assert_eq!(entry.attributes[0].attr_type, b"cn");
        assert_eq!(entry.attributes[0].values, vec![b"a".to_vec()]);

        let result = SearchResult::from(entry);
        assert_eq!(result.dn, "cn=a");
        assert_eq!(result.attributes["cn"], ["a"]);
    }

    #[test]
    fn test_decode_envelope_captures_controls() {
        // controls [0] { SEQUENCE { "1.2.3.4" } } after the BindResponse:
        // control 04 07 "1.2.3.4" -> 30 09; list a0 0b; content 3 + 9 + 13
        // = 25 (0x19).
        let buf = [
            0x30, 0x19, 0x02, 0x01, 0x00, //
            0x61, 0x07, 0x0a, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00, //
            0xa0, 0x0b, 0x30, 0x09, 0x04, 0x07, b'1', b'.', b'2', b'.', b'3', b'.', b'4',
        ];
        let (_, result, controls): (i64, LdapResult, Vec<RawValue>) =
            decode_message(&buf, opts("application,tag:1")).unwrap();
        assert_eq!(result.result_code, RESULT_SUCCESS);
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].tag, TAG_SEQUENCE);
        assert!(controls[0].constructed);
        assert_eq!(&controls[0].bytes[..2], [0x04, 0x07]);
        assert_eq!(&controls[0].bytes[2..], b"1.2.3.4");
    }

    #[test]
    fn test_decode_extended_response_components() {
        // [APPLICATION 24] { ENUM 0, "", "" } - the LDAPResult fields are
        // inlined, no responseName/Value.
        let buf = [
            0x30, 0x0c, 0x02, 0x01, 0x01, 0x78, 0x07, 0x0a, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00,
        ];
        let (_, resp, _): (i64, ExtendedResponse, Vec<RawValue>) =
            decode_message(&buf, opts("application,tag:24")).unwrap();
        assert_eq!(resp.result.result_code, RESULT_SUCCESS);
        assert!(resp.name.is_empty());
        assert!(resp.value.is_empty());
    }

    #[test]
    fn test_decode_extended_response_with_name() {
        // responseName [10] "1.3.6.1.4.1.1466.20037" (22 bytes) follows the
        // inlined result: 7 + 24 = 31 (0x1f).
        let oid = START_TLS_OID.as_bytes();
        let mut buf = vec![
            0x30, 0x24, 0x02, 0x01, 0x01, 0x78, 0x1f, 0x0a, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00,
            0x8a, 0x16,
        ];
        buf.extend_from_slice(oid);
        let (_, resp, _): (i64, ExtendedResponse, Vec<RawValue>) =
            decode_message(&buf, opts("application,tag:24")).unwrap();
        assert_eq!(resp.result.result_code, RESULT_SUCCESS);
        assert_eq!(resp.name, oid);
    }

    #[test]
    fn test_encode_extended_request_starttls() {
        let req = ExtendedRequest {
            name: START_TLS_OID.as_bytes().to_vec(),
            value: Vec::new(),
        };
        let buf = encode_message(2, &req, opts("application,tag:23")).unwrap();
        // requestName [0] is implicit under the session flag; the optional
        // empty requestValue is omitted.
        assert_eq!(&buf[..7], [0x30, 0x1d, 0x02, 0x01, 0x02, 0x77, 0x18]);
        assert_eq!(buf[7], 0x80);
        assert_eq!(buf[8], 0x16);
        assert_eq!(&buf[9..], START_TLS_OID.as_bytes());
    }

    #[test]
    fn test_encode_search_request() {
        let req = SearchRequest::new("dc=example", Filter::present("objectClass"));
        let buf = encode_message(3, &req, opts("application,tag:3")).unwrap();
        // SEQUENCE, messageID 3, then [APPLICATION 3].
        assert_eq!(buf[0], 0x30);
        assert_eq!(&buf[2..5], [0x02, 0x01, 0x03]);
        assert_eq!(buf[5], 0x63);
        // baseObject, then ENUMERATED scope and derefAliases.
        assert_eq!(&buf[7..9], [0x04, 0x0a]);
        assert_eq!(&buf[9..19], b"dc=example");
        assert_eq!(&buf[19..22], [0x0a, 0x01, 0x02]); // wholeSubtree
        assert_eq!(&buf[22..25], [0x0a, 0x01, 0x00]); // neverDerefAliases
    }

    #[test]
    fn test_search_request_roundtrip_sizes() {
        // The envelope length must cover exactly the encoded content.
        let req = SearchRequest::new("", Filter::present("cn"));
        let buf = encode_message(0, &req, opts("application,tag:3")).unwrap();
        assert_eq!(buf[1] as usize, buf.len() - 2);
    }
}
