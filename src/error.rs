use std::io;

use thiserror::Error;

use crate::asn1::BerError;
use crate::message::LdapResult;

/// Session-level errors.
///
/// A non-success result code from the server is `ResultCode`, a structured
/// value distinct from a broken stream (`Io`) or malformed wire data
/// (`Ber`). Wire-format errors leave the session out of alignment with the
/// stream, so the session is not safe to reuse after one.
#[derive(Debug, Error)]
pub enum LdapError {
    #[error(transparent)]
    Ber(#[from] BerError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("{op} failed: resultCode = {code} ({message})")]
    ResultCode {
        op: &'static str,
        code: i32,
        message: String,
    },
    #[error("invalid ldap address {0:?}")]
    InvalidAddress(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("tls configuration: {0}")]
    TlsConfig(String),
}

impl LdapError {
    pub(crate) fn result(op: &'static str, result: &LdapResult) -> LdapError {
        LdapError::ResultCode {
            op,
            code: result.result_code,
            message: result.diagnostic(),
        }
    }
}
