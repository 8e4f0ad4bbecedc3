//! Structures that represent SOCKS5 negotiation messages.
//!
//! Each message can be encoded to bytes, decoded from a byte slice with
//! [`tor_bytes::Reader`], or read whole from any [`AsyncRead`].

use crate::{Error, Result};

use caret::caret_int;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tor_bytes::Error as BytesError;
use tor_bytes::Result as BytesResult;
use tor_bytes::{Readable, Reader, Writeable, Writer};

use std::convert::TryFrom;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Version byte that starts every SOCKS5 message.
pub const SOCKS5_VERSION: u8 = 5;

/// Version byte of the username/password sub-negotiation (RFC 1929).
pub const USERPASS_VERSION: u8 = 1;

caret_int! {
    /// A SOCKS5 authentication method code.
    pub struct AuthMethod(u8) {
        /// RFC 1928: "NO AUTHENTICATION REQUIRED"
        NO_AUTH = 0x00,
        /// RFC 1928: "GSSAPI"
        GSSAPI = 0x01,
        /// RFC 1928: "USERNAME/PASSWORD"
        USERNAME_PASSWORD = 0x02,
        /// RFC 1928: "NO ACCEPTABLE METHODS"
        NO_ACCEPTABLE = 0xFF,
    }
}

caret_int! {
    /// Command from a SOCKS client telling the server what to do.
    pub struct SocksCmd(u8) {
        /// Connect to a remote TCP address:port.
        CONNECT = 1,
        /// Accept an incoming TCP connection.
        BIND = 2,
        /// Relay UDP datagrams.
        UDP_ASSOCIATE = 3,
    }
}

caret_int! {
    /// Possible reply status values from a SOCKS5 server.
    pub struct SocksStatus(u8) {
        /// RFC 1928: "succeeded"
        SUCCEEDED = 0x00,
        /// RFC 1928: "general SOCKS server failure"
        GENERAL_FAILURE = 0x01,
        /// RFC 1928: "connection not allowable by ruleset"
        NOT_ALLOWED = 0x02,
        /// RFC 1928: "Network unreachable"
        NETWORK_UNREACHABLE = 0x03,
        /// RFC 1928: "Host unreachable"
        HOST_UNREACHABLE = 0x04,
        /// RFC 1928: "Connection refused"
        CONNECTION_REFUSED = 0x05,
        /// RFC 1928: "TTL expired"
        TTL_EXPIRED = 0x06,
        /// RFC 1928: "Command not supported"
        COMMAND_NOT_SUPPORTED = 0x07,
        /// RFC 1928: "Address type not supported"
        ADDRTYPE_NOT_SUPPORTED = 0x08,
    }
}

/// Status byte for a successful username/password check.
pub const USERPASS_SUCCEEDED: u8 = 0x00;
/// Status byte we send for a failed username/password check.
pub const USERPASS_FAILED: u8 = 0x01;

/// An address sent or received as part of a SOCKS request or reply.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum SocksAddr {
    /// A regular DNS hostname.
    Hostname(SocksHostname),
    /// An IP address.
    Ip(IpAddr),
}

/// A hostname for use with SOCKS.  It is limited in length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocksHostname(String);

impl TryFrom<String> for SocksHostname {
    type Error = Error;
    fn try_from(s: String) -> Result<SocksHostname> {
        if s.len() > 255 {
            Err(Error::NoSupport)
        } else {
            Ok(SocksHostname(s))
        }
    }
}

impl AsRef<str> for SocksHostname {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksAddr::Ip(a) => write!(f, "{}", a),
            SocksAddr::Hostname(h) => write!(f, "{}", h.0),
        }
    }
}

impl Readable for SocksAddr {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<SocksAddr> {
        let atype = r.take_u8()?;
        match atype {
            1 => {
                let ip4: std::net::Ipv4Addr = r.extract()?;
                Ok(SocksAddr::Ip(ip4.into()))
            }
            3 => {
                let hlen = r.take_u8()?;
                let hostname = r.take(hlen as usize)?;
                let hostname = std::str::from_utf8(hostname)
                    .map_err(|_| BytesError::BadMessage("bad utf8 on hostname"))?
                    .to_string();
                Ok(SocksAddr::Hostname(SocksHostname(hostname)))
            }
            4 => {
                let ip6: std::net::Ipv6Addr = r.extract()?;
                Ok(SocksAddr::Ip(ip6.into()))
            }
            _ => Err(BytesError::BadMessage("unrecognized address type.")),
        }
    }
}

impl Writeable for SocksAddr {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) {
        match self {
            SocksAddr::Ip(IpAddr::V4(ip)) => {
                w.write_u8(1);
                w.write(ip);
            }
            SocksAddr::Ip(IpAddr::V6(ip)) => {
                w.write_u8(4);
                w.write(ip);
            }
            SocksAddr::Hostname(h) => {
                // SocksHostname can't be constructed any longer than this.
                let hlen = h.0.len() as u8;
                w.write_u8(3);
                w.write_u8(hlen);
                w.write(h.0.as_bytes());
            }
        }
    }
}

/// Read an address and a port from `stream`, given the address type
/// byte that was already read.  Appends the raw bytes to `buf`.
async fn read_addr_port<R: AsyncRead + Unpin + ?Sized>(
    stream: &mut R,
    atype: u8,
    buf: &mut Vec<u8>,
) -> Result<()> {
    buf.push(atype);
    let addr_len = match atype {
        1 => 4,
        4 => 16,
        3 => {
            let mut hlen = [0_u8; 1];
            stream.read_exact(&mut hlen).await?;
            buf.push(hlen[0]);
            hlen[0] as usize
        }
        _ => return Err(Error::Syntax),
    };
    let start = buf.len();
    buf.resize(start + addr_len + 2, 0);
    stream.read_exact(&mut buf[start..]).await?;
    Ok(())
}

/// Write all of `msg` onto `stream` and flush it.
pub(crate) async fn send<W>(stream: &mut W, msg: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(msg).await?;
    stream.flush().await?;
    Ok(())
}

/// Decode exactly one `T` from `body`, rejecting any leftover bytes.
fn decode_all<T: Readable>(body: &[u8]) -> Result<T> {
    let mut r = Reader::from_slice(body);
    let msg = r.extract()?;
    r.should_be_exhausted()?;
    Ok(msg)
}

/// Check that a handshake message began with the version we expect.
fn check_version(got: u8, want: u8) -> Result<()> {
    if got == want {
        Ok(())
    } else {
        Err(Error::BadVersion(got))
    }
}

/// A client's opening message, listing the authentication methods it
/// supports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodRequest {
    /// Methods in the order the client listed them.
    methods: Vec<AuthMethod>,
}

impl MethodRequest {
    /// Construct a new MethodRequest.
    ///
    /// An empty list is sent as a single [`AuthMethod::NO_AUTH`], since
    /// the protocol requires at least one method.  Only the first 255
    /// methods are kept.
    pub fn new(methods: &[AuthMethod]) -> Self {
        let methods = if methods.is_empty() {
            vec![AuthMethod::NO_AUTH]
        } else {
            methods.iter().take(255).copied().collect()
        };
        MethodRequest { methods }
    }

    /// Return the methods listed in this request.
    pub fn methods(&self) -> &[AuthMethod] {
        &self.methods[..]
    }

    /// Encode this request for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Vec::new();
        Writer::write(&mut w, self);
        w
    }

    /// Read one MethodRequest from `stream`.
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(stream: &mut R) -> Result<Self> {
        let mut hdr = [0_u8; 2];
        stream.read_exact(&mut hdr).await?;
        check_version(hdr[0], SOCKS5_VERSION)?;
        let mut body = vec![0_u8; 2 + hdr[1] as usize];
        body[..2].copy_from_slice(&hdr);
        stream.read_exact(&mut body[2..]).await?;
        decode_all(&body)
    }
}

impl Writeable for MethodRequest {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) {
        w.write_u8(SOCKS5_VERSION);
        w.write_u8(self.methods.len() as u8);
        for m in &self.methods {
            w.write_u8((*m).into());
        }
    }
}

impl Readable for MethodRequest {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        if r.take_u8()? != SOCKS5_VERSION {
            return Err(BytesError::BadMessage("not a SOCKS5 method request"));
        }
        let n = r.take_u8()?;
        let methods = r.take(n as usize)?.iter().map(|m| (*m).into()).collect();
        Ok(MethodRequest { methods })
    }
}

/// A server's choice of authentication method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodSelection {
    /// The method the server picked.
    method: AuthMethod,
}

impl MethodSelection {
    /// Construct a new MethodSelection.
    pub fn new(method: AuthMethod) -> Self {
        MethodSelection { method }
    }

    /// Return the selected method.
    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// Encode this selection for the wire.
    pub fn encode(&self) -> [u8; 2] {
        [SOCKS5_VERSION, self.method.into()]
    }

    /// Read one MethodSelection from `stream`.
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(stream: &mut R) -> Result<Self> {
        let mut b = [0_u8; 2];
        stream.read_exact(&mut b).await?;
        check_version(b[0], SOCKS5_VERSION)?;
        Ok(MethodSelection::new(b[1].into()))
    }
}

/// An RFC 1929 username/password request.
#[derive(Clone, PartialEq, Eq)]
pub struct UserPassRequest {
    /// Username bytes; at most 255 of them.
    username: Vec<u8>,
    /// Password bytes; at most 255 of them.
    password: Vec<u8>,
}

impl UserPassRequest {
    /// Construct a new UserPassRequest.
    ///
    /// Gives [`Error::NoSupport`] if either field is longer than 255 bytes.
    pub fn new(username: &[u8], password: &[u8]) -> Result<Self> {
        if username.len() > 255 || password.len() > 255 {
            return Err(Error::NoSupport);
        }
        Ok(UserPassRequest {
            username: username.into(),
            password: password.into(),
        })
    }

    /// Return the username from this request.
    pub fn username(&self) -> &[u8] {
        &self.username[..]
    }

    /// Return the password from this request.
    pub fn password(&self) -> &[u8] {
        &self.password[..]
    }

    /// Encode this request for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Vec::new();
        w.write_u8(USERPASS_VERSION);
        w.write_u8(self.username.len() as u8);
        Writer::write_all(&mut w, &self.username[..]);
        w.write_u8(self.password.len() as u8);
        Writer::write_all(&mut w, &self.password[..]);
        w
    }

    /// Write this request onto `stream`.
    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, stream: &mut W) -> Result<()> {
        send(stream, &self.encode()[..]).await
    }

    /// Read one UserPassRequest from `stream`.
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(stream: &mut R) -> Result<Self> {
        let mut hdr = [0_u8; 2];
        stream.read_exact(&mut hdr).await?;
        check_version(hdr[0], USERPASS_VERSION)?;
        let mut username = vec![0_u8; hdr[1] as usize];
        stream.read_exact(&mut username[..]).await?;
        let mut plen = [0_u8; 1];
        stream.read_exact(&mut plen).await?;
        let mut password = vec![0_u8; plen[0] as usize];
        stream.read_exact(&mut password[..]).await?;
        Ok(UserPassRequest { username, password })
    }
}

impl fmt::Debug for UserPassRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPassRequest")
            .field("username", &String::from_utf8_lossy(&self.username))
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An RFC 1929 username/password response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserPassResponse {
    /// Zero for success; anything else is a failure.
    status: u8,
}

impl UserPassResponse {
    /// Construct a new UserPassResponse.
    pub fn new(status: u8) -> Self {
        UserPassResponse { status }
    }

    /// Return the status byte of this response.
    pub fn status(&self) -> u8 {
        self.status
    }

    /// Return true if this response reports success.
    pub fn is_success(&self) -> bool {
        self.status == USERPASS_SUCCEEDED
    }

    /// Encode this response for the wire.
    pub fn encode(&self) -> [u8; 2] {
        [USERPASS_VERSION, self.status]
    }

    /// Read one UserPassResponse from `stream`.
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(stream: &mut R) -> Result<Self> {
        let mut b = [0_u8; 2];
        stream.read_exact(&mut b).await?;
        check_version(b[0], USERPASS_VERSION)?;
        Ok(UserPassResponse::new(b[1]))
    }
}

/// A SOCKS5 command request, sent by the client once negotiation is
/// done.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    /// What the client wants done.
    cmd: SocksCmd,
    /// The target address.
    addr: SocksAddr,
    /// The target port.
    port: u16,
}

impl Request {
    /// Construct a new Request.
    pub fn new(cmd: SocksCmd, addr: SocksAddr, port: u16) -> Self {
        Request { cmd, addr, port }
    }

    /// Return the command of this request.
    pub fn command(&self) -> SocksCmd {
        self.cmd
    }

    /// Return the requested address.
    pub fn addr(&self) -> &SocksAddr {
        &self.addr
    }

    /// Return the requested port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Encode this request for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Vec::new();
        Writer::write(&mut w, self);
        w
    }

    /// Read one Request from `stream`.
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(stream: &mut R) -> Result<Self> {
        let mut body = vec![0_u8; 4];
        stream.read_exact(&mut body[..]).await?;
        check_version(body[0], SOCKS5_VERSION)?;
        let atype = body.pop().unwrap_or_default();
        read_addr_port(stream, atype, &mut body).await?;
        decode_all(&body)
    }
}

impl Writeable for Request {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) {
        w.write_u8(SOCKS5_VERSION);
        w.write_u8(self.cmd.into());
        w.write_u8(0); // reserved.
        w.write(&self.addr);
        w.write_u16(self.port);
    }
}

impl Readable for Request {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        if r.take_u8()? != SOCKS5_VERSION {
            return Err(BytesError::BadMessage("not a SOCKS5 request"));
        }
        let cmd = r.take_u8()?.into();
        let _reserved = r.take_u8()?;
        let addr = r.extract()?;
        let port = r.take_u16()?;
        Ok(Request { cmd, addr, port })
    }
}

/// A generic SOCKS5 reply, sent by the server in answer to a
/// [`Request`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    /// Whether the request worked.
    status: SocksStatus,
    /// The bound address, if any.
    addr: SocksAddr,
    /// The bound port, if any.
    port: u16,
}

impl Reply {
    /// Construct a new Reply.
    ///
    /// Without an address, the reply carries `0.0.0.0:0`.
    pub fn new(status: SocksStatus, addr: Option<(SocksAddr, u16)>) -> Self {
        let (addr, port) =
            addr.unwrap_or_else(|| (SocksAddr::Ip(Ipv4Addr::UNSPECIFIED.into()), 0));
        Reply { status, addr, port }
    }

    /// Return the status of this reply.
    pub fn status(&self) -> SocksStatus {
        self.status
    }

    /// Return the address in this reply.
    pub fn addr(&self) -> &SocksAddr {
        &self.addr
    }

    /// Return the port in this reply.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Encode this reply for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Vec::new();
        Writer::write(&mut w, self);
        w
    }

    /// Read one Reply from `stream`.
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(stream: &mut R) -> Result<Self> {
        let mut body = vec![0_u8; 4];
        stream.read_exact(&mut body[..]).await?;
        check_version(body[0], SOCKS5_VERSION)?;
        let atype = body.pop().unwrap_or_default();
        read_addr_port(stream, atype, &mut body).await?;
        decode_all(&body)
    }
}

impl Writeable for Reply {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) {
        w.write_u8(SOCKS5_VERSION);
        w.write_u8(self.status.into());
        w.write_u8(0); // reserved.
        w.write(&self.addr);
        w.write_u16(self.port);
    }
}

impl Readable for Reply {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        if r.take_u8()? != SOCKS5_VERSION {
            return Err(BytesError::BadMessage("not a SOCKS5 reply"));
        }
        let status = r.take_u8()?.into();
        let _reserved = r.take_u8()?;
        let addr = r.extract()?;
        let port = r.take_u16()?;
        Ok(Reply { status, addr, port })
    }
}
