//! BER codec for ASN.1 values (ITU-T X.690 subset used by LDAPv3).
//!
//! The schema is described at the call site: every field carries a
//! [`FieldOptions`] parsed from a comma-separated annotation string
//! (`"application,tag:0,optional"`), and the [`decode::FromBer`] /
//! [`encode::ToBer`] impl of a record type lists its fields in order.

pub mod decode;
pub mod encode;
pub mod scanner;

pub use decode::{Decoder, FromBer, Scope};
pub use encode::{Encoder, ToBer};
pub use scanner::{Ident, Length};

use std::io;
use thiserror::Error;

/// ASN.1 tag class (bits 7-6 of the first identifier octet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Class {
    #[default]
    Universal = 0,
    Application = 1,
    Context = 2,
    Private = 3,
}

impl Class {
    pub(crate) fn from_bits(byte: u8) -> Class {
        match (byte >> 6) & 0x03 {
            0 => Class::Universal,
            1 => Class::Application,
            2 => Class::Context,
            _ => Class::Private,
        }
    }

    pub(crate) fn bits(self) -> u8 {
        (self as u8) << 6
    }
}

// Universal tags used by LDAPv3.
pub const TAG_BOOLEAN: u32 = 0x01;
pub const TAG_INTEGER: u32 = 0x02;
pub const TAG_OCTET_STRING: u32 = 0x04;
pub const TAG_NULL: u32 = 0x05;
pub const TAG_ENUMERATED: u32 = 0x0a;
pub const TAG_SEQUENCE: u32 = 0x10;
pub const TAG_SET: u32 = 0x11;

/// Escape hatch for deferred decoding and pre-built encoding.
///
/// `bytes` holds the content octets only; `raw_bytes` holds the complete
/// TLV (re-assembled with a shortest-form definite length on decode) and is
/// always well formed, so it can be fed back through a fresh decoder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawValue {
    pub class: Class,
    pub tag: u32,
    pub constructed: bool,
    pub bytes: Vec<u8>,
    pub raw_bytes: Vec<u8>,
}

/// Codec errors.
///
/// `TagMismatch` is the one recoverable case: a well-formed identifier that
/// does not match the expected schema. `optional` field decoding rolls the
/// identifier back and leaves the field at its zero value; everywhere else
/// it is terminal, like `Structural`.
#[derive(Debug, Error)]
pub enum BerError {
    #[error("ASN.1 incomplete TLV: {0}")]
    Incomplete(&'static str),
    #[error("ASN.1 syntax error: {0}")]
    Syntax(String),
    #[error("ASN.1 structural error: {0}")]
    Structural(String),
    #[error("ASN.1 structural error: tag mismatch (class = {class:?}, tag = {tag:#x}, constructed = {constructed})")]
    TagMismatch {
        class: Class,
        tag: u32,
        constructed: bool,
    },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl BerError {
    pub(crate) fn mismatch(ident: Ident) -> BerError {
        BerError::TagMismatch {
            class: ident.class,
            tag: ident.tag,
            constructed: ident.constructed,
        }
    }
}

/// Per-field schema options, resolved from an annotation string.
///
/// Recognised options: `tag:N`, `implicit`, `explicit`, `application`,
/// `optional`, `enum`, `set`, `components`. A `tag:N` without `implicit`
/// defaults to explicit tagging unless the codec-global implicit flag is
/// set (LDAP runs with it on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldOptions {
    pub tag: Option<u32>,
    pub implicit: bool,
    pub explicit: bool,
    pub application: bool,
    pub optional: bool,
    pub enumerated: bool,
    pub set: bool,
    pub components: bool,
}

impl FieldOptions {
    pub fn parse(s: &str) -> Result<FieldOptions, BerError> {
        let mut opts = FieldOptions::default();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some(n) = part.strip_prefix("tag:") {
                let tag = n
                    .parse::<u32>()
                    .map_err(|_| BerError::Structural(format!("invalid tag number {:?}", n)))?;
                opts.tag = Some(tag);
                continue;
            }
            match part {
                "implicit" => opts.implicit = true,
                "explicit" => opts.explicit = true,
                "application" => opts.application = true,
                "optional" => opts.optional = true,
                "enum" => opts.enumerated = true,
                "set" => opts.set = true,
                "components" => opts.components = true,
                _ => {
                    return Err(BerError::Structural(format!(
                        "unrecognized field option {:?}",
                        part
                    )))
                }
            }
        }
        Ok(opts)
    }

    /// Effective tagging mode for a `tag:N` override. `implicit` on the
    /// field wins, then `explicit`, then the codec-global flag.
    pub(crate) fn is_implicit(&self, global: bool) -> bool {
        self.implicit || (global && !self.explicit)
    }

    pub(crate) fn override_class(&self) -> Class {
        if self.application {
            Class::Application
        } else {
            Class::Context
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_options() {
        let opts = FieldOptions::parse("application,tag:0,optional").unwrap();
        assert_eq!(opts.tag, Some(0));
        assert!(opts.application);
        assert!(opts.optional);
        assert!(!opts.implicit);

        let opts = FieldOptions::parse("tag:3,implicit").unwrap();
        assert_eq!(opts.tag, Some(3));
        assert!(opts.is_implicit(false));

        let opts = FieldOptions::parse("enum").unwrap();
        assert!(opts.enumerated);

        assert_eq!(FieldOptions::parse("").unwrap(), FieldOptions::default());
    }

    #[test]
    fn test_parse_field_options_rejects_unknown() {
        assert!(FieldOptions::parse("bogus").is_err());
        assert!(FieldOptions::parse("tag:x").is_err());
    }

    #[test]
    fn test_implicit_resolution() {
        // tag:N alone is explicit, unless the global flag is set.
        let opts = FieldOptions::parse("tag:1").unwrap();
        assert!(!opts.is_implicit(false));
        assert!(opts.is_implicit(true));

        // An explicit `explicit` survives the global flag.
        let opts = FieldOptions::parse("tag:1,explicit").unwrap();
        assert!(!opts.is_implicit(true));
    }
}
