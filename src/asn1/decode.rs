//! BER decoder.
//!
//! [`Decoder`] wraps a byte stream and consumes exactly one TLV per
//! `decode` call (including any explicit wrapper and end-of-content
//! marker). Record types implement [`FromBer`] by listing their fields in
//! order; the decoder walks descriptor and stream in lockstep.
//!
//! Definite-length constructed values are decoded under a byte-budget
//! scope; indefinite-length constructed values are decoded from the live
//! stream until an end-of-content header. OPTIONAL rollback is a
//! one-identifier peek buffer: a mismatched identifier is pushed back and
//! re-read by the next field.

use std::io::Read;

use crate::asn1::scanner::{write_length, Ident, Length};
use crate::asn1::{
    BerError, Class, FieldOptions, RawValue, TAG_BOOLEAN, TAG_ENUMERATED, TAG_INTEGER, TAG_NULL,
    TAG_OCTET_STRING, TAG_SEQUENCE, TAG_SET,
};

/// How the current constructed value ends: byte budget exhausted, or an
/// end-of-content marker on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Definite,
    Indefinite,
}

/// Types decodable from BER driven by [`FieldOptions`].
pub trait FromBer: Sized {
    fn from_ber<R: Read>(dec: &mut Decoder<R>, opts: FieldOptions) -> Result<Self, BerError>;

    /// Decodes the fields of a record directly from the enclosing scope,
    /// with no wrapping TLV (ASN.1 `COMPONENTS OF`).
    fn from_ber_components<R: Read>(_dec: &mut Decoder<R>) -> Result<Self, BerError> {
        Err(BerError::Structural(
            "COMPONENTS OF requires a constructed type".into(),
        ))
    }
}

pub struct Decoder<R> {
    reader: R,
    /// Treat every `tag:N` without `explicit` as implicit (LDAP mode).
    pub implicit: bool,
    peeked: Option<(Ident, usize)>,
    limit: Option<usize>,
    consumed: u64,
}

impl<R: Read> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder {
            reader,
            implicit: false,
            peeked: None,
            limit: None,
            consumed: 0,
        }
    }

    pub fn decode<T: FromBer>(&mut self) -> Result<T, BerError> {
        self.decode_with(FieldOptions::default())
    }

    pub fn decode_with<T: FromBer>(&mut self, opts: FieldOptions) -> Result<T, BerError> {
        if opts.components {
            return T::from_ber_components(self);
        }
        if opts.tag.is_some() && !opts.is_implicit(self.implicit) {
            return self.decode_explicit(opts);
        }
        T::from_ber(self, opts)
    }

    /// Decodes one field of a record. With `optional`, a tag mismatch at
    /// the identifier is swallowed: the identifier is pushed back for the
    /// next field and the result is the type's zero value.
    pub fn field<T: FromBer + Default>(&mut self, opts: FieldOptions) -> Result<T, BerError> {
        if !opts.optional {
            return self.decode_with(opts);
        }
        if !self.has_more() {
            return Ok(T::default());
        }
        let before = self.consumed;
        match self.decode_with(opts) {
            Err(BerError::TagMismatch { .. }) if self.consumed == before => Ok(T::default()),
            other => other,
        }
    }

    /// Reads the header of a constructed value, then runs `body` over its
    /// content scope. `natural_tag` is the universal tag expected when no
    /// override is in play (SEQUENCE or SET).
    pub fn constructed<T>(
        &mut self,
        opts: FieldOptions,
        natural_tag: u32,
        body: impl FnOnce(&mut Self, Scope) -> Result<T, BerError>,
    ) -> Result<T, BerError> {
        let (ident, nbytes) = self.read_ident()?;
        let ok = ident.constructed
            && match opts.tag {
                Some(t) => ident.tag == t && override_class_ok(ident.class, &opts),
                None => ident.class == Class::Universal && ident.tag == natural_tag,
            };
        if !ok {
            self.unread_ident(ident, nbytes);
            return Err(BerError::mismatch(ident));
        }
        self.with_scope(body)
    }

    /// Decodes a homogeneous SEQUENCE OF / SET OF.
    pub fn sequence_of<T: FromBer>(&mut self, opts: FieldOptions) -> Result<Vec<T>, BerError> {
        let natural = if opts.set { TAG_SET } else { TAG_SEQUENCE };
        self.constructed(opts, natural, |dec, scope| {
            let mut out = Vec::new();
            while dec.more_elements(scope)? {
                out.push(dec.decode_with::<T>(FieldOptions::default())?);
            }
            Ok(out)
        })
    }

    /// True while the current constructed scope holds another element.
    pub fn more_elements(&mut self, scope: Scope) -> Result<bool, BerError> {
        match scope {
            Scope::Definite => Ok(self.has_more()),
            Scope::Indefinite => {
                let (ident, nbytes) = self.read_ident()?;
                let more = !ident.is_eoc();
                self.unread_ident(ident, nbytes);
                Ok(more)
            }
        }
    }

    /// Reads the content of a primitive TLV after checking its identifier
    /// against the schema.
    pub fn primitive(
        &mut self,
        opts: &FieldOptions,
        natural_tags: &[u32],
    ) -> Result<Vec<u8>, BerError> {
        let (ident, nbytes) = self.read_ident()?;
        let ok = match opts.tag {
            Some(t) => ident.tag == t && override_class_ok(ident.class, opts),
            None => {
                ident.class == Class::Universal
                    && !ident.constructed
                    && natural_tags.contains(&ident.tag)
            }
        };
        if !ok {
            self.unread_ident(ident, nbytes);
            return Err(BerError::mismatch(ident));
        }
        if ident.constructed {
            return Err(BerError::Syntax(
                "constructed encoding where a primitive is required".into(),
            ));
        }
        let len = self.read_length()?;
        self.content(len)
    }

    fn decode_explicit<T: FromBer>(&mut self, opts: FieldOptions) -> Result<T, BerError> {
        let (ident, nbytes) = self.read_ident()?;
        let ok =
            ident.constructed && Some(ident.tag) == opts.tag && override_class_ok(ident.class, &opts);
        if !ok {
            self.unread_ident(ident, nbytes);
            return Err(BerError::mismatch(ident));
        }
        self.with_scope(|dec, _| dec.decode_with::<T>(FieldOptions::default()))
    }

    fn with_scope<T>(
        &mut self,
        body: impl FnOnce(&mut Self, Scope) -> Result<T, BerError>,
    ) -> Result<T, BerError> {
        match self.read_length()? {
            Length::Definite(n) => {
                let saved = self.push_scope(n)?;
                let out = body(self, Scope::Definite)?;
                self.pop_scope(saved)?;
                Ok(out)
            }
            Length::Indefinite => {
                let out = body(self, Scope::Indefinite)?;
                self.expect_eoc()?;
                Ok(out)
            }
        }
    }

    // Scanner primitives.

    fn read_u8(&mut self) -> Result<u8, BerError> {
        if self.limit == Some(0) {
            return Err(BerError::Incomplete("value ends inside a nested TLV"));
        }
        let mut b = [0u8; 1];
        match self.reader.read_exact(&mut b) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(BerError::Incomplete("unexpected end of stream"))
            }
            Err(e) => return Err(BerError::Io(e)),
        }
        if let Some(l) = &mut self.limit {
            *l -= 1;
        }
        self.consumed += 1;
        Ok(b[0])
    }

    fn read_ident(&mut self) -> Result<(Ident, usize), BerError> {
        if let Some((ident, nbytes)) = self.peeked.take() {
            if let Some(l) = &mut self.limit {
                *l -= nbytes;
            }
            self.consumed += nbytes as u64;
            return Ok((ident, nbytes));
        }
        let b0 = self.read_u8()?;
        let class = Class::from_bits(b0);
        let constructed = b0 & 0x20 == 0x20;
        let mut nbytes = 1usize;
        let mut tag = u32::from(b0 & 0x1f);
        if tag == 0x1f {
            tag = 0;
            let mut first = true;
            loop {
                let b = self.read_u8()?;
                nbytes += 1;
                if first && b & 0x7f == 0 {
                    return Err(BerError::Syntax("long-form tag".into()));
                }
                first = false;
                tag = (tag << 7) | u32::from(b & 0x7f);
                if b & 0x80 == 0 {
                    break;
                }
                if nbytes > 6 {
                    return Err(BerError::Syntax("tag number too large".into()));
                }
            }
        }
        Ok((
            Ident {
                class,
                tag,
                constructed,
            },
            nbytes,
        ))
    }

    fn unread_ident(&mut self, ident: Ident, nbytes: usize) {
        debug_assert!(self.peeked.is_none());
        if let Some(l) = &mut self.limit {
            *l += nbytes;
        }
        self.consumed -= nbytes as u64;
        self.peeked = Some((ident, nbytes));
    }

    fn read_length(&mut self) -> Result<Length, BerError> {
        let b0 = self.read_u8()?;
        if b0 < 0x80 {
            return Ok(Length::Definite(b0 as usize));
        }
        if b0 == 0x80 {
            return Ok(Length::Indefinite);
        }
        if b0 == 0xff {
            return Err(BerError::Syntax("long-form length".into()));
        }
        let width = (b0 & 0x7f) as usize;
        if width > 8 {
            return Err(BerError::Syntax(format!(
                "length of length too large: {} octets",
                width
            )));
        }
        let mut len: u64 = 0;
        for _ in 0..width {
            len = (len << 8) | u64::from(self.read_u8()?);
        }
        usize::try_from(len)
            .map(Length::Definite)
            .map_err(|_| BerError::Syntax("length overflow".into()))
    }

    fn content(&mut self, len: Length) -> Result<Vec<u8>, BerError> {
        match len {
            Length::Definite(n) => self.content_fixed(n),
            Length::Indefinite => self.content_indefinite(),
        }
    }

    /// Reads exactly `n` content octets.
    fn content_fixed(&mut self, n: usize) -> Result<Vec<u8>, BerError> {
        if let Some(l) = self.limit {
            if n > l {
                return Err(BerError::Incomplete("value ends inside a nested TLV"));
            }
        }
        let mut buf = Vec::new();
        let got = (&mut self.reader)
            .take(n as u64)
            .read_to_end(&mut buf)
            .map_err(BerError::Io)?;
        self.consumed += got as u64;
        if let Some(l) = &mut self.limit {
            *l -= got;
        }
        if got < n {
            return Err(BerError::Incomplete("unexpected end of stream"));
        }
        Ok(buf)
    }

    /// Collects octets up to (not including) the first two consecutive zero
    /// octets. The scanner does not recurse into nested TLVs; callers that
    /// need nesting feed the collected bytes through a fresh decoder.
    fn content_indefinite(&mut self) -> Result<Vec<u8>, BerError> {
        let mut buf = vec![self.read_u8()?, self.read_u8()?];
        loop {
            if buf[buf.len() - 2] == 0 && buf[buf.len() - 1] == 0 {
                buf.truncate(buf.len() - 2);
                return Ok(buf);
            }
            let b = self.read_u8()?;
            buf.push(b);
        }
    }

    fn expect_eoc(&mut self) -> Result<(), BerError> {
        let (ident, _nbytes) = self.read_ident()?;
        if !ident.is_eoc() {
            return Err(BerError::Structural("missing end-of-content".into()));
        }
        let l = self.read_u8()?;
        if l != 0 {
            return Err(BerError::Syntax(format!(
                "end-of-content tag with non-zero length byte {:#04x}",
                l
            )));
        }
        Ok(())
    }

    fn push_scope(&mut self, n: usize) -> Result<Option<usize>, BerError> {
        match self.limit {
            Some(outer) => {
                if n > outer {
                    return Err(BerError::Incomplete("value ends inside a nested TLV"));
                }
                self.limit = Some(n);
                Ok(Some(outer - n))
            }
            None => {
                self.limit = Some(n);
                Ok(None)
            }
        }
    }

    fn pop_scope(&mut self, saved: Option<usize>) -> Result<(), BerError> {
        if self.peeked.is_some() || self.limit != Some(0) {
            return Err(BerError::Structural(
                "trailing data after the last field".into(),
            ));
        }
        self.limit = saved;
        Ok(())
    }

    fn has_more(&self) -> bool {
        self.peeked.is_some() || self.limit != Some(0)
    }
}

fn override_class_ok(class: Class, opts: &FieldOptions) -> bool {
    (opts.application && class == Class::Application) || class == Class::Context
}

/// Big-endian accumulation without sign extension; full-width negative
/// values round-trip through the wrapping shift.
pub(crate) fn int_from_content(b: &[u8]) -> Result<i64, BerError> {
    if b.is_empty() {
        return Err(BerError::Syntax(
            "integer must have at least one byte of content".into(),
        ));
    }
    if b.len() > 8 {
        return Err(BerError::Structural("integer overflow".into()));
    }
    let mut i: i64 = 0;
    for &x in b {
        i = i.wrapping_shl(8) | i64::from(x);
    }
    Ok(i)
}

macro_rules! impl_from_ber_int {
    ($($t:ty),+) => {$(
        impl FromBer for $t {
            fn from_ber<R: Read>(dec: &mut Decoder<R>, opts: FieldOptions) -> Result<Self, BerError> {
                let content = dec.primitive(&opts, &[TAG_INTEGER, TAG_ENUMERATED])?;
                let wide = int_from_content(&content)?;
                <$t>::try_from(wide).map_err(|_| BerError::Structural("integer overflow".into()))
            }
        }
    )+};
}

impl_from_ber_int!(i8, i16, i32, i64);

impl FromBer for bool {
    fn from_ber<R: Read>(dec: &mut Decoder<R>, opts: FieldOptions) -> Result<Self, BerError> {
        let content = dec.primitive(&opts, &[TAG_BOOLEAN])?;
        if content.len() != 1 {
            return Err(BerError::Syntax(format!(
                "booleans must be exactly one byte (len = {})",
                content.len()
            )));
        }
        Ok(content[0] != 0)
    }
}

impl FromBer for Vec<u8> {
    fn from_ber<R: Read>(dec: &mut Decoder<R>, opts: FieldOptions) -> Result<Self, BerError> {
        dec.primitive(&opts, &[TAG_OCTET_STRING])
    }
}

impl FromBer for () {
    fn from_ber<R: Read>(dec: &mut Decoder<R>, opts: FieldOptions) -> Result<Self, BerError> {
        let content = dec.primitive(&opts, &[TAG_NULL])?;
        if !content.is_empty() {
            return Err(BerError::Syntax("NULL must have empty content".into()));
        }
        Ok(())
    }
}

impl FromBer for RawValue {
    /// Captures one TLV without interpreting it. Any identifier is
    /// accepted; `raw_bytes` is re-assembled with a shortest-form definite
    /// length so it can be fed through a fresh decoder.
    fn from_ber<R: Read>(dec: &mut Decoder<R>, _opts: FieldOptions) -> Result<Self, BerError> {
        let (ident, nbytes) = dec.read_ident()?;
        if ident.is_eoc() {
            dec.unread_ident(ident, nbytes);
            return Err(BerError::mismatch(ident));
        }
        let len = dec.read_length()?;
        let bytes = dec.content(len)?;
        let mut raw_bytes = Vec::with_capacity(ident.encoded_len() + 2 + bytes.len());
        ident.write_to(&mut raw_bytes);
        write_length(&mut raw_bytes, bytes.len());
        raw_bytes.extend_from_slice(&bytes);
        Ok(RawValue {
            class: ident.class,
            tag: ident.tag,
            constructed: ident.constructed,
            bytes,
            raw_bytes,
        })
    }
}

impl FromBer for Vec<Vec<u8>> {
    fn from_ber<R: Read>(dec: &mut Decoder<R>, opts: FieldOptions) -> Result<Self, BerError> {
        dec.sequence_of::<Vec<u8>>(opts)
    }
}

impl FromBer for Vec<RawValue> {
    fn from_ber<R: Read>(dec: &mut Decoder<R>, opts: FieldOptions) -> Result<Self, BerError> {
        dec.sequence_of::<RawValue>(opts)
    }
}
