//! Client-side LDAP session.
//!
//! A session owns its stream, serialises operations on it, assigns
//! monotonically increasing message IDs, and swaps the stream for a
//! TLS-wrapped one on a successful StartTLS. Concurrent operations on one
//! session are not supported; callers serialise (every operation takes
//! `&mut self`).

use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use bytes::BytesMut;
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::asn1::encode::ToBer;
use crate::asn1::scanner::complete_tlv_len;
use crate::asn1::{Class, Decoder, FieldOptions, RawValue, TAG_NULL};
use crate::error::LdapError;
use crate::message::{
    decode_message, encode_message, BindRequest, ExtendedRequest, ExtendedResponse, LdapResult,
    SearchRequest, SearchResult, SearchResultEntry, APP_SEARCH_RESULT_DONE,
    APP_SEARCH_RESULT_ENTRY, APP_SEARCH_RESULT_REFERENCE, LDAP_VERSION, RESULT_SUCCESS,
    START_TLS_OID,
};

/// Upper bound on one inbound LDAPMessage.
const MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

/// Session transport: plain TCP or TLS-wrapped. `Closed` is the state after
/// the stream has been handed off (mid-StartTLS) or torn down.
pub(crate) enum LdapStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Closed,
    #[cfg(test)]
    Mem(tokio::io::DuplexStream),
}

fn closed_err() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "ldap session closed")
}

impl AsyncRead for LdapStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            LdapStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            LdapStream::Closed => Poll::Ready(Err(closed_err())),
            #[cfg(test)]
            LdapStream::Mem(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LdapStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            LdapStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            LdapStream::Closed => Poll::Ready(Err(closed_err())),
            #[cfg(test)]
            LdapStream::Mem(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            LdapStream::Tls(s) => Pin::new(s).poll_flush(cx),
            LdapStream::Closed => Poll::Ready(Ok(())),
            #[cfg(test)]
            LdapStream::Mem(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            LdapStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            LdapStream::Closed => Poll::Ready(Ok(())),
            #[cfg(test)]
            LdapStream::Mem(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Unpin for LdapStream {}

/// An LDAPv3 client session over one connection.
pub struct LdapConn {
    stream: LdapStream,
    read_buf: BytesMut,
    next_id: AtomicI32,
}

impl LdapConn {
    fn new(stream: LdapStream) -> LdapConn {
        LdapConn {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            next_id: AtomicI32::new(0),
        }
    }

    /// Connects over plain TCP. `addr` is `host:port`.
    pub async fn dial(addr: &str) -> Result<LdapConn, LdapError> {
        let tcp = TcpStream::connect(addr).await?;
        debug!("connected to {}", addr);
        Ok(LdapConn::new(LdapStream::Tcp(tcp)))
    }

    /// Connects with TLS from the first byte (ldaps).
    pub async fn dial_ssl(addr: &str, config: Arc<ClientConfig>) -> Result<LdapConn, LdapError> {
        let host = host_part(addr)?.to_string();
        let server_name = ServerName::try_from(host)
            .map_err(|_| LdapError::InvalidAddress(addr.to_string()))?;
        let tcp = TcpStream::connect(addr).await?;
        let connector = TlsConnector::from(config);
        let tls = connector.connect(server_name, tcp).await?;
        debug!("TLS session established with {}", addr);
        Ok(LdapConn::new(LdapStream::Tls(Box::new(tls))))
    }

    /// Connects over plain TCP, then upgrades with StartTLS.
    pub async fn dial_tls(addr: &str, config: Arc<ClientConfig>) -> Result<LdapConn, LdapError> {
        let host = host_part(addr)?.to_string();
        let mut conn = LdapConn::dial(addr).await?;
        conn.start_tls(config, &host).await?;
        Ok(conn)
    }

    /// Resolves the host part of `addr` and tries each address with the
    /// supplied dialer until one connects.
    pub async fn round_robin<F, Fut>(addr: &str, mut dial: F) -> Result<LdapConn, LdapError>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<LdapConn, LdapError>>,
    {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| LdapError::InvalidAddress(addr.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| LdapError::InvalidAddress(addr.to_string()))?;
        let mut last_err = None;
        for resolved in tokio::net::lookup_host((host, port)).await? {
            match dial(resolved.to_string()).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!("dial {} failed: {}", resolved, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| LdapError::InvalidAddress(addr.to_string())))
    }

    /// Simple bind. Success iff the server answers resultCode 0.
    pub async fn bind(&mut self, user: &str, password: &str) -> Result<(), LdapError> {
        debug!("bind request for {:?}", user);
        let id = self.next_message_id();
        let req = BindRequest {
            version: LDAP_VERSION,
            name: user.as_bytes().to_vec(),
            password: password.as_bytes().to_vec(),
        };
        self.send_op(id, &req, "application,tag:0").await?;
        let buf = self.read_message().await?;
        let (_, result, _controls): (i64, LdapResult, Vec<RawValue>) =
            decode_message(&buf, FieldOptions::parse("application,tag:1")?)?;
        if result.result_code != RESULT_SUCCESS {
            return Err(LdapError::result("bind", &result));
        }
        info!("bind successful for {:?}", user);
        Ok(())
    }

    /// Sends an UnbindRequest and closes the stream. No response is
    /// expected; the stream is shut down even if the send fails.
    pub async fn unbind(mut self) -> Result<(), LdapError> {
        let id = self.next_message_id();
        let op = RawValue {
            class: Class::Universal,
            tag: TAG_NULL,
            ..RawValue::default()
        };
        let sent = self.send_op(id, &op, "application,tag:2").await;
        if let Err(e) = self.stream.shutdown().await {
            debug!("shutdown after unbind: {}", e);
        }
        sent
    }

    /// Runs one search and collects the streamed entries until the server
    /// sends SearchResultDone.
    pub async fn search(&mut self, request: SearchRequest) -> Result<Vec<SearchResult>, LdapError> {
        debug!("search base={:?}", request.base_object);
        let id = self.next_message_id();
        self.send_op(id, &request, "application,tag:3").await?;

        let mut results = Vec::new();
        loop {
            let buf = self.read_message().await?;
            // First pass: the envelope with the protocolOp left raw, to peek
            // at the application tag. Second pass: the raw bytes through a
            // fresh implicit-mode decoder with the tag-specific options.
            let (_, raw, _controls): (i64, RawValue, Vec<RawValue>) =
                decode_message(&buf, FieldOptions::default())?;
            match raw.tag {
                APP_SEARCH_RESULT_ENTRY => {
                    let mut dec = Decoder::new(raw.raw_bytes.as_slice());
                    dec.implicit = true;
                    let entry: SearchResultEntry =
                        dec.decode_with(FieldOptions::parse("application,tag:4")?)?;
                    results.push(SearchResult::from(entry));
                }
                APP_SEARCH_RESULT_DONE => {
                    let mut dec = Decoder::new(raw.raw_bytes.as_slice());
                    dec.implicit = true;
                    let done: LdapResult =
                        dec.decode_with(FieldOptions::parse("application,tag:5")?)?;
                    if done.result_code != RESULT_SUCCESS {
                        return Err(LdapError::result("search", &done));
                    }
                    break;
                }
                APP_SEARCH_RESULT_REFERENCE => {
                    // References are not followed.
                }
                tag => warn!("ignoring protocolOp tag {} in search response", tag),
            }
        }
        debug!("search returned {} entries", results.len());
        Ok(results)
    }

    /// Upgrades the connection to TLS via the StartTLS extended operation.
    /// `domain` is the name presented for certificate verification (SNI).
    pub async fn start_tls(
        &mut self,
        config: Arc<ClientConfig>,
        domain: &str,
    ) -> Result<(), LdapError> {
        if !matches!(self.stream, LdapStream::Tcp(_)) {
            return Err(LdapError::Protocol(
                "STARTTLS requires a plain TCP session".into(),
            ));
        }
        let id = self.next_message_id();
        let req = ExtendedRequest {
            name: START_TLS_OID.as_bytes().to_vec(),
            value: Vec::new(),
        };
        self.send_op(id, &req, "application,tag:23").await?;
        let buf = self.read_message().await?;
        let (_, resp, _controls): (i64, ExtendedResponse, Vec<RawValue>) =
            decode_message(&buf, FieldOptions::parse("application,tag:24")?)?;
        if resp.result.result_code != RESULT_SUCCESS {
            return Err(LdapError::result("STARTTLS", &resp.result));
        }

        // No pre-TLS bytes may remain buffered when the transport swaps.
        if !self.read_buf.is_empty() {
            return Err(LdapError::Protocol(
                "unread data buffered before TLS negotiation".into(),
            ));
        }
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|_| LdapError::InvalidAddress(domain.to_string()))?;
        let tcp = match std::mem::replace(&mut self.stream, LdapStream::Closed) {
            LdapStream::Tcp(tcp) => tcp,
            other => {
                self.stream = other;
                return Err(LdapError::Protocol(
                    "STARTTLS requires a plain TCP session".into(),
                ));
            }
        };
        let connector = TlsConnector::from(config);
        let tls = connector.connect(server_name, tcp).await?;
        self.stream = LdapStream::Tls(Box::new(tls));
        info!("TLS negotiated with {}", domain);
        Ok(())
    }

    fn next_message_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_op<T: ToBer>(
        &mut self,
        message_id: i32,
        op: &T,
        opts: &str,
    ) -> Result<(), LdapError> {
        let buf = encode_message(i64::from(message_id), op, FieldOptions::parse(opts)?)?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads exactly one complete TLV off the stream.
    async fn read_message(&mut self) -> Result<Vec<u8>, LdapError> {
        loop {
            if let Some(n) = complete_tlv_len(&self.read_buf)? {
                if n > MAX_MESSAGE_BYTES {
                    return Err(LdapError::Protocol(format!(
                        "message of {} bytes exceeds the {} byte limit",
                        n, MAX_MESSAGE_BYTES
                    )));
                }
                return Ok(self.read_buf.split_to(n).to_vec());
            }
            if self.read_buf.len() > MAX_MESSAGE_BYTES {
                return Err(LdapError::Protocol(format!(
                    "message exceeds the {} byte limit",
                    MAX_MESSAGE_BYTES
                )));
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(LdapError::Protocol("connection closed by peer".into()));
            }
        }
    }
}

/// Host part of a `host:port` address, with IPv6 brackets stripped.
fn host_part(addr: &str) -> Result<&str, LdapError> {
    let (host, _port) = addr
        .rsplit_once(':')
        .ok_or_else(|| LdapError::InvalidAddress(addr.to_string()))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(LdapError::InvalidAddress(addr.to_string()));
    }
    Ok(host)
}
