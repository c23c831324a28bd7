//! SOCKS 5 server-side negotiation (RFC 1928, RFC 1929).
//!
//! The negotiation moves through greeting, method selection, the optional
//! username/password subnegotiation, and the command request. It reads
//! exactly the bytes each stage needs straight from the stream, so nothing
//! past the command request is consumed. The reply stage is written by the
//! caller once it knows the outcome of the request.

use super::{AuthType, ServerConfig};
use portway_core::{Address, Destination, HandshakeStage, ProxyError, ProxyResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const AUTH_VERSION: u8 = 0x01;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_PASSWORD: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

const AUTH_SUCCESS: u8 = 0x00;
const AUTH_FAILURE: u8 = 0x01;

/// Requested SOCKS command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    UdpAssociate,
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub command: Command,
    pub destination: Destination,
    /// Username, when password authentication was used.
    pub user: Option<String>,
}

/// Server side of one negotiation.
pub struct ServerSession<'a> {
    config: &'a ServerConfig,
    /// Address echoed in UDP ASSOCIATE replies when none is configured.
    local_ip: Option<IpAddr>,
    /// Port echoed in UDP ASSOCIATE replies.
    gateway_port: u16,
}

impl<'a> ServerSession<'a> {
    pub fn new(config: &'a ServerConfig, local_ip: Option<IpAddr>, gateway_port: u16) -> Self {
        Self {
            config,
            local_ip,
            gateway_port,
        }
    }

    /// Run greeting, method selection, authentication and command request.
    ///
    /// Failures that the protocol defines a reply for (no acceptable method,
    /// bad credentials, unsupported command or address type) send that reply
    /// before returning the error.
    pub async fn handshake<S>(&self, stream: &mut S) -> ProxyResult<HandshakeRequest>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let methods = read_greeting(stream).await?;
        let method = self.select_method(stream, &methods).await?;
        let user = if method == METHOD_PASSWORD {
            Some(self.authenticate(stream).await?)
        } else {
            None
        };
        let (command, destination) = self.read_command(stream).await?;
        debug!(command = ?command, destination = %destination, "socks request parsed");
        Ok(HandshakeRequest {
            command,
            destination,
            user,
        })
    }

    /// Bind address for a UDP ASSOCIATE reply: the configured address or
    /// the connection's local address, with the gateway port.
    pub fn udp_bind_destination(&self) -> Destination {
        let ip = self
            .config
            .address
            .or(self.local_ip)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Destination::udp(Address::Ip(ip), self.gateway_port)
    }

    async fn select_method<S>(&self, stream: &mut S, offered: &[u8]) -> ProxyResult<u8>
    where
        S: AsyncWrite + Unpin + ?Sized,
    {
        let wanted = match self.config.auth_type {
            AuthType::NoAuth => METHOD_NO_AUTH,
            AuthType::Password => METHOD_PASSWORD,
        };
        if !offered.contains(&wanted) {
            write_stage(
                stream,
                &[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE],
                HandshakeStage::MethodSelection,
            )
            .await?;
            return Err(ProxyError::handshake(
                HandshakeStage::MethodSelection,
                format!("no acceptable method among {offered:02x?}"),
            ));
        }
        write_stage(stream, &[SOCKS5_VERSION, wanted], HandshakeStage::MethodSelection).await?;
        Ok(wanted)
    }

    async fn authenticate<S>(&self, stream: &mut S) -> ProxyResult<String>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let stage = HandshakeStage::AuthSubnegotiation;
        let version = read_u8(stream, stage).await?;
        if version != AUTH_VERSION {
            return Err(ProxyError::handshake(
                stage,
                format!("unknown auth version {version:#04x}"),
            ));
        }
        let user = read_string(stream, stage).await?;
        let pass = read_string(stream, stage).await?;

        if !self.config.has_account(&user, &pass) {
            write_stage(stream, &[AUTH_VERSION, AUTH_FAILURE], stage).await?;
            return Err(ProxyError::AuthFailed(format!("invalid user {user}")));
        }
        write_stage(stream, &[AUTH_VERSION, AUTH_SUCCESS], stage).await?;
        Ok(user)
    }

    async fn read_command<S>(&self, stream: &mut S) -> ProxyResult<(Command, Destination)>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let stage = HandshakeStage::CommandRequest;
        let mut head = [0u8; 4];
        read_exact(stream, &mut head, stage).await?;
        let [version, cmd, _reserved, atyp] = head;
        if version != SOCKS5_VERSION {
            return Err(ProxyError::handshake(
                stage,
                format!("unexpected version {version:#04x} in request"),
            ));
        }

        let address = match atyp {
            ATYP_IPV4 => {
                let mut b = [0u8; 4];
                read_exact(stream, &mut b, stage).await?;
                Address::Ip(IpAddr::V4(Ipv4Addr::from(b)))
            }
            ATYP_IPV6 => {
                let mut b = [0u8; 16];
                read_exact(stream, &mut b, stage).await?;
                Address::Ip(IpAddr::V6(Ipv6Addr::from(b)))
            }
            ATYP_DOMAIN => Address::parse(&read_string(stream, stage).await?),
            other => {
                write_reply(stream, REPLY_ADDRESS_NOT_SUPPORTED, &unspecified()).await?;
                return Err(ProxyError::UnsupportedAddressType(other));
            }
        };
        let mut port = [0u8; 2];
        read_exact(stream, &mut port, stage).await?;
        let port = u16::from_be_bytes(port);

        match cmd {
            CMD_CONNECT => Ok((Command::Connect, Destination::tcp(address, port))),
            CMD_UDP_ASSOCIATE if self.config.udp_enabled => {
                Ok((Command::UdpAssociate, Destination::udp(address, port)))
            }
            other => {
                // BIND, and UDP ASSOCIATE while UDP is off.
                write_reply(stream, REPLY_COMMAND_NOT_SUPPORTED, &unspecified()).await?;
                Err(ProxyError::UnsupportedCommand(other))
            }
        }
    }
}

/// Read the greeting and return the offered method identifiers.
async fn read_greeting<S>(stream: &mut S) -> ProxyResult<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let stage = HandshakeStage::Greeting;
    let version = read_u8(stream, stage).await?;
    if version != SOCKS5_VERSION {
        return Err(ProxyError::handshake(
            stage,
            format!("unsupported version {version:#04x}"),
        ));
    }
    let count = read_u8(stream, stage).await? as usize;
    let mut methods = vec![0u8; count];
    read_exact(stream, &mut methods, stage).await?;
    Ok(methods)
}

/// Write a command reply: `VER REP RSV ATYP BND.ADDR BND.PORT`.
pub async fn write_reply<S>(stream: &mut S, code: u8, bind: &Destination) -> ProxyResult<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    write_stage(stream, &encode_reply(code, bind), HandshakeStage::Reply).await
}

pub fn encode_reply(code: u8, bind: &Destination) -> Vec<u8> {
    let mut out = vec![SOCKS5_VERSION, code, 0x00];
    match &bind.address {
        Address::Ip(IpAddr::V4(v4)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&v4.octets());
        }
        Address::Ip(IpAddr::V6(v6)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&v6.octets());
        }
        Address::Domain(d) | Address::Path(d) => {
            let bytes = &d.as_bytes()[..d.len().min(255)];
            out.push(ATYP_DOMAIN);
            out.push(bytes.len() as u8);
            out.extend_from_slice(bytes);
        }
    }
    out.extend_from_slice(&bind.port.to_be_bytes());
    out
}

/// `0.0.0.0:0`, the bind address echoed for CONNECT and failures.
pub fn unspecified() -> Destination {
    Destination::tcp(Address::any(), 0)
}

async fn read_u8<S>(stream: &mut S, stage: HandshakeStage) -> ProxyResult<u8>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut b = [0u8; 1];
    read_exact(stream, &mut b, stage).await?;
    Ok(b[0])
}

/// Length-prefixed string, as used for domains and credentials.
async fn read_string<S>(stream: &mut S, stage: HandshakeStage) -> ProxyResult<String>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let len = read_u8(stream, stage).await? as usize;
    let mut buf = vec![0u8; len];
    read_exact(stream, &mut buf, stage).await?;
    String::from_utf8(buf).map_err(|_| ProxyError::handshake(stage, "invalid utf-8"))
}

async fn read_exact<S>(stream: &mut S, buf: &mut [u8], stage: HandshakeStage) -> ProxyResult<()>
where
    S: AsyncRead + Unpin + ?Sized,
{
    stream
        .read_exact(buf)
        .await
        .map(|_| ())
        .map_err(|e| ProxyError::handshake(stage, format!("read failed: {e}")))
}

async fn write_stage<S>(stream: &mut S, data: &[u8], stage: HandshakeStage) -> ProxyResult<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    stream
        .write_all(data)
        .await
        .map_err(|e| ProxyError::handshake(stage, format!("write failed: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| ProxyError::handshake(stage, format!("flush failed: {e}")))
}
