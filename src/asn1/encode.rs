//! BER encoder.
//!
//! Content is built into a buffer first so the definite, shortest-form
//! length is known before the header is written. Indefinite lengths are
//! never produced.

use std::io::Write;

use crate::asn1::scanner::{write_length, Ident};
use crate::asn1::{
    BerError, Class, FieldOptions, RawValue, TAG_BOOLEAN, TAG_ENUMERATED, TAG_INTEGER, TAG_NULL,
    TAG_OCTET_STRING, TAG_SEQUENCE, TAG_SET,
};

/// Types encodable to BER driven by [`FieldOptions`].
pub trait ToBer {
    /// Natural identifier of the value, before any `tag:N` override.
    fn ber_ident(&self, opts: &FieldOptions) -> Ident;

    /// Content octets. `implicit` is the codec-global implicit flag, passed
    /// down so nested fields resolve their own tag overrides.
    fn ber_content(&self, implicit: bool) -> Result<Vec<u8>, BerError>;

    /// True when the value equals its zero value; `optional` fields that
    /// are zero are omitted from the output.
    fn is_zero(&self) -> bool;
}

pub struct Encoder<W> {
    writer: W,
    /// Treat every `tag:N` without `explicit` as implicit (LDAP mode).
    pub implicit: bool,
}

impl<W: Write> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder {
            writer,
            implicit: false,
        }
    }

    pub fn encode<T: ToBer + ?Sized>(&mut self, value: &T) -> Result<(), BerError> {
        self.encode_with(value, FieldOptions::default())
    }

    /// Produces exactly one TLV (plus the explicit wrapper when the options
    /// call for one).
    pub fn encode_with<T: ToBer + ?Sized>(
        &mut self,
        value: &T,
        opts: FieldOptions,
    ) -> Result<(), BerError> {
        let mut buf = Vec::new();
        encode_field(&mut buf, value, opts, self.implicit)?;
        self.writer.write_all(&buf)?;
        Ok(())
    }
}

/// Encodes one field into `out`, honouring the field options.
pub(crate) fn encode_field<T: ToBer + ?Sized>(
    out: &mut Vec<u8>,
    value: &T,
    opts: FieldOptions,
    implicit: bool,
) -> Result<(), BerError> {
    if opts.optional && value.is_zero() {
        return Ok(());
    }

    if let Some(tag) = opts.tag {
        if !opts.is_implicit(implicit) {
            // Explicit tagging: the natural TLV wrapped in a constructed
            // TLV carrying the override tag.
            let mut inner = Vec::new();
            encode_field(&mut inner, value, FieldOptions::default(), implicit)?;
            Ident::constructed(opts.override_class(), tag).write_to(out);
            write_length(out, inner.len());
            out.extend_from_slice(&inner);
            return Ok(());
        }
    }

    let mut ident = value.ber_ident(&opts);
    let content = value.ber_content(implicit)?;

    if opts.components {
        if !ident.constructed {
            return Err(BerError::Structural(
                "cannot encode COMPONENTS OF a primitive value".into(),
            ));
        }
        out.extend_from_slice(&content);
        return Ok(());
    }

    if let Some(tag) = opts.tag {
        ident.tag = tag;
        ident.class = opts.override_class();
    }
    ident.write_to(out);
    write_length(out, content.len());
    out.extend_from_slice(&content);
    Ok(())
}

/// Big-endian two's complement with leading zero octets stripped; the value
/// zero keeps a single octet. Redundant 0xff octets of negative values are
/// kept, matching the decoder's accumulator.
pub(crate) fn int_content(i: i64) -> Vec<u8> {
    let bytes = i.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 && bytes[start] == 0 {
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Concatenated element encodings for SEQUENCE OF / SET OF content.
pub(crate) fn sequence_content<T: ToBer>(
    items: &[T],
    implicit: bool,
) -> Result<Vec<u8>, BerError> {
    let mut out = Vec::new();
    for item in items {
        encode_field(&mut out, item, FieldOptions::default(), implicit)?;
    }
    Ok(out)
}

macro_rules! impl_to_ber_int {
    ($($t:ty),+) => {$(
        impl ToBer for $t {
            fn ber_ident(&self, opts: &FieldOptions) -> Ident {
                let tag = if opts.enumerated { TAG_ENUMERATED } else { TAG_INTEGER };
                Ident::primitive(Class::Universal, tag)
            }
            fn ber_content(&self, _implicit: bool) -> Result<Vec<u8>, BerError> {
                Ok(int_content(i64::from(*self)))
            }
            fn is_zero(&self) -> bool {
                *self == 0
            }
        }
    )+};
}

impl_to_ber_int!(i8, i16, i32, i64);

impl ToBer for bool {
    fn ber_ident(&self, _opts: &FieldOptions) -> Ident {
        Ident::primitive(Class::Universal, TAG_BOOLEAN)
    }
    fn ber_content(&self, _implicit: bool) -> Result<Vec<u8>, BerError> {
        Ok(vec![if *self { 0xff } else { 0x00 }])
    }
    fn is_zero(&self) -> bool {
        !*self
    }
}

impl ToBer for Vec<u8> {
    fn ber_ident(&self, _opts: &FieldOptions) -> Ident {
        Ident::primitive(Class::Universal, TAG_OCTET_STRING)
    }
    fn ber_content(&self, _implicit: bool) -> Result<Vec<u8>, BerError> {
        Ok(self.clone())
    }
    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

impl ToBer for String {
    fn ber_ident(&self, _opts: &FieldOptions) -> Ident {
        Ident::primitive(Class::Universal, TAG_OCTET_STRING)
    }
    fn ber_content(&self, _implicit: bool) -> Result<Vec<u8>, BerError> {
        Ok(self.as_bytes().to_vec())
    }
    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

impl ToBer for () {
    fn ber_ident(&self, _opts: &FieldOptions) -> Ident {
        Ident::primitive(Class::Universal, TAG_NULL)
    }
    fn ber_content(&self, _implicit: bool) -> Result<Vec<u8>, BerError> {
        Ok(Vec::new())
    }
    fn is_zero(&self) -> bool {
        true
    }
}

impl ToBer for RawValue {
    fn ber_ident(&self, _opts: &FieldOptions) -> Ident {
        Ident {
            class: self.class,
            tag: self.tag,
            constructed: self.constructed,
        }
    }
    fn ber_content(&self, _implicit: bool) -> Result<Vec<u8>, BerError> {
        Ok(self.bytes.clone())
    }
    fn is_zero(&self) -> bool {
        *self == RawValue::default()
    }
}

macro_rules! impl_to_ber_sequence_of {
    ($($t:ty),+) => {$(
        impl ToBer for Vec<$t> {
            fn ber_ident(&self, opts: &FieldOptions) -> Ident {
                let tag = if opts.set { TAG_SET } else { TAG_SEQUENCE };
                Ident::constructed(Class::Universal, tag)
            }
            fn ber_content(&self, implicit: bool) -> Result<Vec<u8>, BerError> {
                sequence_content(self, implicit)
            }
            fn is_zero(&self) -> bool {
                self.is_empty()
            }
        }
    )+};
}

impl_to_ber_sequence_of!(String, Vec<u8>, RawValue);
