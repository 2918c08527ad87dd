//! Search filters (RFC 4511 §4.5.1.7).
//!
//! Filter is a context-tagged CHOICE; each variant carries its own tag, so
//! the encoder ignores any field-level override and emits the variant's
//! identifier directly. `not` wraps its operand in a constructed TLV (a
//! CHOICE cannot take an implicit tag).

use crate::asn1::encode::{encode_field, sequence_content, ToBer};
use crate::asn1::{BerError, Class, FieldOptions, Ident};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `and [0] SET OF Filter`
    And(Vec<Filter>),
    /// `or [1] SET OF Filter`
    Or(Vec<Filter>),
    /// `not [2] Filter`
    Not(Box<Filter>),
    /// `equalityMatch [3] AttributeValueAssertion`
    Equals { attribute: String, value: Vec<u8> },
    /// `substrings [4] SubstringFilter`
    Substrings {
        attribute: String,
        parts: Vec<Substring>,
    },
    /// `present [7] AttributeDescription`
    Present(String),
    /// `extensibleMatch [9] MatchingRuleAssertion`
    Matches(MatchingRuleAssertion),
}

/// One component of a substring filter, in order of appearance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Substring {
    /// `initial [0]` - at most one, first.
    Initial(Vec<u8>),
    /// `any [1]`
    Any(Vec<u8>),
    /// `final [2]` - at most one, last.
    Final(Vec<u8>),
}

/// MatchingRuleAssertion ::= SEQUENCE { matchingRule [1] OPTIONAL,
/// type [2] OPTIONAL, matchValue [3], dnAttributes [4] DEFAULT FALSE }
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchingRuleAssertion {
    pub matching_rule: Vec<u8>,
    pub attr_type: Vec<u8>,
    pub match_value: Vec<u8>,
    pub dn_attributes: bool,
}

impl Filter {
    pub fn and(filters: Vec<Filter>) -> Filter {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Filter {
        Filter::Or(filters)
    }

    pub fn not(filter: Filter) -> Filter {
        Filter::Not(Box::new(filter))
    }

    pub fn equals(attribute: &str, value: &str) -> Filter {
        Filter::Equals {
            attribute: attribute.to_string(),
            value: value.as_bytes().to_vec(),
        }
    }

    pub fn present(attribute: &str) -> Filter {
        Filter::Present(attribute.to_string())
    }

    pub fn substrings(attribute: &str, parts: Vec<Substring>) -> Filter {
        Filter::Substrings {
            attribute: attribute.to_string(),
            parts,
        }
    }

    pub fn matches(
        matching_rule: Option<&str>,
        attr_type: Option<&str>,
        value: &str,
        dn_attributes: bool,
    ) -> Filter {
        Filter::Matches(MatchingRuleAssertion {
            matching_rule: matching_rule.map(|s| s.as_bytes().to_vec()).unwrap_or_default(),
            attr_type: attr_type.map(|s| s.as_bytes().to_vec()).unwrap_or_default(),
            match_value: value.as_bytes().to_vec(),
            dn_attributes,
        })
    }
}

impl Substring {
    pub fn initial(s: &str) -> Substring {
        Substring::Initial(s.as_bytes().to_vec())
    }

    pub fn any(s: &str) -> Substring {
        Substring::Any(s.as_bytes().to_vec())
    }

    pub fn final_(s: &str) -> Substring {
        Substring::Final(s.as_bytes().to_vec())
    }
}

impl ToBer for Filter {
    fn ber_ident(&self, _opts: &FieldOptions) -> Ident {
        match self {
            Filter::And(_) => Ident::constructed(Class::Context, 0),
            Filter::Or(_) => Ident::constructed(Class::Context, 1),
            Filter::Not(_) => Ident::constructed(Class::Context, 2),
            Filter::Equals { .. } => Ident::constructed(Class::Context, 3),
            Filter::Substrings { .. } => Ident::constructed(Class::Context, 4),
            Filter::Present(_) => Ident::primitive(Class::Context, 7),
            Filter::Matches(_) => Ident::constructed(Class::Context, 9),
        }
    }

    fn ber_content(&self, implicit: bool) -> Result<Vec<u8>, BerError> {
        let mut out = Vec::new();
        match self {
            Filter::And(filters) | Filter::Or(filters) => {
                for filter in filters {
                    encode_field(&mut out, filter, FieldOptions::default(), implicit)?;
                }
            }
            Filter::Not(filter) => {
                encode_field(&mut out, filter.as_ref(), FieldOptions::default(), implicit)?;
            }
            Filter::Equals { attribute, value } => {
                encode_field(&mut out, attribute, FieldOptions::default(), implicit)?;
                encode_field(&mut out, value, FieldOptions::default(), implicit)?;
            }
            Filter::Substrings { attribute, parts } => {
                encode_field(&mut out, attribute, FieldOptions::default(), implicit)?;
                encode_field(&mut out, parts, FieldOptions::default(), implicit)?;
            }
            Filter::Present(attribute) => {
                out.extend_from_slice(attribute.as_bytes());
            }
            Filter::Matches(m) => {
                encode_field(&mut out, &m.matching_rule, FieldOptions::parse("tag:1,optional")?, implicit)?;
                encode_field(&mut out, &m.attr_type, FieldOptions::parse("tag:2,optional")?, implicit)?;
                encode_field(&mut out, &m.match_value, FieldOptions::parse("tag:3")?, implicit)?;
                encode_field(&mut out, &m.dn_attributes, FieldOptions::parse("tag:4,optional")?, implicit)?;
            }
        }
        Ok(out)
    }

    fn is_zero(&self) -> bool {
        false
    }
}

impl ToBer for Substring {
    fn ber_ident(&self, _opts: &FieldOptions) -> Ident {
        let tag = match self {
            Substring::Initial(_) => 0,
            Substring::Any(_) => 1,
            Substring::Final(_) => 2,
        };
        Ident::primitive(Class::Context, tag)
    }

    fn ber_content(&self, _implicit: bool) -> Result<Vec<u8>, BerError> {
        let (Substring::Initial(b) | Substring::Any(b) | Substring::Final(b)) = self;
        Ok(b.clone())
    }

    fn is_zero(&self) -> bool {
        false
    }
}

impl ToBer for Vec<Substring> {
    fn ber_ident(&self, _opts: &FieldOptions) -> Ident {
        Ident::constructed(Class::Universal, crate::asn1::TAG_SEQUENCE)
    }

    fn ber_content(&self, implicit: bool) -> Result<Vec<u8>, BerError> {
        sequence_content(self, implicit)
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn1::Encoder;

    /// Filters always travel inside the implicit-mode session encoder.
    fn encode(filter: &Filter) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.implicit = true;
        enc.encode(filter).unwrap();
        buf
    }

    #[test]
    fn test_encode_present() {
        assert_eq!(
            encode(&Filter::present("objectClass")),
            [
                0x87, 0x0b, b'o', b'b', b'j', b'e', b'c', b't', b'C', b'l', b'a', b's', b's'
            ]
        );
    }

    #[test]
    fn test_encode_equals() {
        // [3] { "cn", "admin" }: 4 + 7 = 11 (0x0b).
        assert_eq!(
            encode(&Filter::equals("cn", "admin")),
            [
                0xa3, 0x0b, 0x04, 0x02, b'c', b'n', 0x04, 0x05, b'a', b'd', b'm', b'i', b'n'
            ]
        );
    }

    #[test]
    fn test_encode_and_or() {
        // [0] { [3] { "cn", "a" } }: inner 04 02 cn + 04 01 a = 9 -> a3 07.
        assert_eq!(
            encode(&Filter::and(vec![Filter::equals("cn", "a")])),
            [0xa0, 0x09, 0xa3, 0x07, 0x04, 0x02, b'c', b'n', 0x04, 0x01, b'a']
        );
        assert_eq!(
            encode(&Filter::or(vec![Filter::present("cn")])),
            [0xa1, 0x04, 0x87, 0x02, b'c', b'n']
        );
    }

    #[test]
    fn test_encode_not() {
        // [2] wraps the full inner TLV.
        assert_eq!(
            encode(&Filter::not(Filter::present("cn"))),
            [0xa2, 0x04, 0x87, 0x02, b'c', b'n']
        );
    }

    #[test]
    fn test_encode_substrings() {
        // SubstringFilter { "cn", { [0] "ad", [1] "mi", [2] "n" } }
        // parts: 4 + 4 + 3 = 11 (0x0b); content: 4 + 13 = 17 (0x11).
        let filter = Filter::substrings(
            "cn",
            vec![
                Substring::initial("ad"),
                Substring::any("mi"),
                Substring::final_("n"),
            ],
        );
        assert_eq!(
            encode(&filter),
            [
                0xa4, 0x11, //
                0x04, 0x02, b'c', b'n', //
                0x30, 0x0b, //
                0x80, 0x02, b'a', b'd', //
                0x81, 0x02, b'm', b'i', //
                0x82, 0x01, b'n',
            ]
        );
    }

    #[test]
    fn test_encode_matches() {
        // [9] { type [2] "cn", matchValue [3] "admin" }: 4 + 7 = 11 (0x0b).
        let filter = Filter::matches(None, Some("cn"), "admin", false);
        assert_eq!(
            encode(&filter),
            [
                0xa9, 0x0b, 0x82, 0x02, b'c', b'n', 0x83, 0x05, b'a', b'd', b'm', b'i', b'n'
            ]
        );
    }

    #[test]
    fn test_encode_matches_with_rule_and_dn() {
        // matchingRule [1] "2.5.13.2", matchValue [3] "x", dnAttributes [4] TRUE.
        let filter = Filter::matches(Some("2.5.13.2"), None, "x", true);
        assert_eq!(
            encode(&filter),
            [
                0xa9, 0x10, //
                0x81, 0x08, b'2', b'.', b'5', b'.', b'1', b'3', b'.', b'2', //
                0x83, 0x01, b'x', //
                0x84, 0x01, 0xff,
            ]
        );
    }
}
