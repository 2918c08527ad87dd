pub mod asn1;
pub mod conn;
pub mod error;
pub mod filter;
pub mod message;
pub mod tls;

pub use asn1::{BerError, Decoder, Encoder, FieldOptions, RawValue};
pub use conn::LdapConn;
pub use error::LdapError;
pub use filter::{Filter, MatchingRuleAssertion, Substring};
pub use message::{DerefAliases, LdapResult, SearchRequest, SearchResult, SearchScope};
