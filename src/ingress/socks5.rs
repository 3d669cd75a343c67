//! SOCKS5 proxy ingress (RFC 1928 + RFC 1929)
//!
//! CONNECT and UDP ASSOCIATE are supported; BIND is rejected. When
//! credentials are configured the username/password subnegotiation is
//! mandatory and compared byte-exact.

use super::udp::UdpAssociation;
use super::{
    pipe_upstream, tune_socket, Address, IngressError, FIRST_FRAME_LIMIT, HANDSHAKE_TIMEOUT,
    SOCKS_FIRST_FRAME_TIMEOUT,
};
use crate::pool::{wait_connected, EchPool, SharedWriter, CONNECT_TIMEOUT};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// SOCKS protocol version
const SOCKS_VERSION: u8 = 0x05;
/// Username/password subnegotiation version
const AUTH_VERSION: u8 = 0x01;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = IngressError;

    fn try_from(value: u8) -> Result<Self, IngressError> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(IngressError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
pub(crate) const ATYP_IPV4: u8 = 0x01;
pub(crate) const ATYP_DOMAIN: u8 = 0x03;
pub(crate) const ATYP_IPV6: u8 = 0x04;

/// Reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Handle one SOCKS5 connection from greeting to stream end.
pub(crate) async fn handle(
    mut stream: TcpStream,
    peer: SocketAddr,
    auth: Option<(String, String)>,
    pool: Arc<EchPool>,
) -> Result<(), IngressError> {
    let (command, address) =
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, negotiate(&mut stream, &auth)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(IngressError::BadRequest(
                    "socks5 handshake timed out".to_string(),
                ))
            }
        };

    match command {
        Command::Connect => {
            info!(%peer, target = %address, "socks5 CONNECT");
            handle_connect(stream, address, pool).await
        }
        Command::UdpAssociate => {
            info!(%peer, "socks5 UDP ASSOCIATE");
            handle_udp_associate(stream, peer, pool).await
        }
        Command::Bind => {
            send_reply(&mut stream, Reply::CommandNotSupported).await?;
            Err(IngressError::UnsupportedCommand(Command::Bind as u8))
        }
    }
}

/// Method negotiation, optional user/pass subnegotiation, and the
/// request itself.
async fn negotiate(
    stream: &mut TcpStream,
    auth: &Option<(String, String)>,
) -> Result<(Command, Address), IngressError> {
    let mut buf = [0u8; 260];

    // Greeting: VER NMETHODS METHODS...
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(IngressError::InvalidSocksVersion(buf[0]));
    }
    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;

    let method = if auth.is_some() {
        if buf[..nmethods].contains(&(AuthMethod::UsernamePassword as u8)) {
            AuthMethod::UsernamePassword
        } else {
            AuthMethod::NoAcceptable
        }
    } else {
        AuthMethod::NoAuth
    };

    stream.write_all(&[SOCKS_VERSION, method as u8]).await?;
    if method == AuthMethod::NoAcceptable {
        return Err(IngressError::AuthenticationFailed);
    }

    if method == AuthMethod::UsernamePassword {
        let (expected_user, expected_pass) = auth.as_ref().expect("auth checked above");

        // VER ULEN UNAME PLEN PASSWD
        stream.read_exact(&mut buf[..2]).await?;
        if buf[0] != AUTH_VERSION {
            return Err(IngressError::BadRequest(format!(
                "unsupported auth subnegotiation version {}",
                buf[0]
            )));
        }
        let ulen = buf[1] as usize;
        let mut username = vec![0u8; ulen];
        stream.read_exact(&mut username).await?;

        stream.read_exact(&mut buf[..1]).await?;
        let plen = buf[0] as usize;
        let mut password = vec![0u8; plen];
        stream.read_exact(&mut password).await?;

        let ok = username == expected_user.as_bytes() && password == expected_pass.as_bytes();
        stream
            .write_all(&[AUTH_VERSION, if ok { 0x00 } else { 0x01 }])
            .await?;
        if !ok {
            return Err(IngressError::AuthenticationFailed);
        }
    }

    // Request: VER CMD RSV ATYP ...
    stream.read_exact(&mut buf[..4]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(IngressError::InvalidSocksVersion(buf[0]));
    }
    let command = match Command::try_from(buf[1]) {
        Ok(command) => command,
        Err(e) => {
            send_reply(stream, Reply::CommandNotSupported).await?;
            return Err(e);
        }
    };
    let atyp = buf[3];

    let address = match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = read_port(stream).await?;
            Address::Ipv4(ip, port)
        }
        ATYP_DOMAIN => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len]).await?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            let port = read_port(stream).await?;
            Address::Domain(domain, port)
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = read_port(stream).await?;
            Address::Ipv6(ip, port)
        }
        other => {
            send_reply(stream, Reply::AddressTypeNotSupported).await?;
            return Err(IngressError::UnsupportedAddressType(other));
        }
    };

    Ok((command, address))
}

async fn read_port(stream: &mut TcpStream) -> Result<u16, IngressError> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

async fn send_reply(stream: &mut TcpStream, reply: Reply) -> Result<(), IngressError> {
    // BND.ADDR/BND.PORT are 0.0.0.0:0 for everything except
    // UDP ASSOCIATE, which builds its own reply.
    stream
        .write_all(&[SOCKS_VERSION, reply as u8, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

async fn send_reply_shared(writer: &SharedWriter, reply: Reply) {
    let _ = writer
        .lock()
        .await
        .write_all(&[SOCKS_VERSION, reply as u8, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await;
}

/// CONNECT: register with a best-effort first frame, confirm, reply,
/// then pipe.
async fn handle_connect(
    mut stream: TcpStream,
    address: Address,
    pool: Arc<EchPool>,
) -> Result<(), IngressError> {
    let target = address.to_string();
    let cid = Uuid::new_v4().to_string();

    // Grab an immediately-following client payload (e.g. a TLS
    // ClientHello) so it rides inside the OPEN. Nothing arriving in
    // the window is fine.
    let mut first = vec![0u8; FIRST_FRAME_LIMIT];
    let n = match tokio::time::timeout(SOCKS_FIRST_FRAME_TIMEOUT, stream.read(&mut first)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => 0,
    };

    tune_socket(&stream);
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));

    let signal = match pool
        .register_and_claim(&cid, &target, &first[..n], Arc::clone(&writer))
        .await
    {
        Ok(signal) => signal,
        Err(e) => {
            warn!(%cid, %target, error = %e, "socks5 CONNECT rejected");
            send_reply_shared(&writer, Reply::GeneralFailure).await;
            return Err(e.into());
        }
    };

    if !wait_connected(signal, CONNECT_TIMEOUT).await {
        warn!(%cid, %target, "socks5 CONNECT timed out");
        pool.send_close(&cid).await;
        pool.remove(&cid);
        send_reply_shared(&writer, Reply::GeneralFailure).await;
        return Err(IngressError::ConnectTimeout);
    }

    send_reply_shared(&writer, Reply::Succeeded).await;
    drop(writer);

    pipe_upstream(read_half, &pool, &cid).await;
    Ok(())
}

/// UDP ASSOCIATE: bind a local UDP socket, report it to the client,
/// and relay datagrams until the control connection dies.
async fn handle_udp_associate(
    mut stream: TcpStream,
    peer: SocketAddr,
    pool: Arc<EchPool>,
) -> Result<(), IngressError> {
    let socket = match UdpSocket::bind(("127.0.0.1", 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            send_reply(&mut stream, Reply::GeneralFailure).await?;
            return Err(e.into());
        }
    };
    let bound = socket.local_addr()?;
    debug!(%peer, %bound, "udp associate bound");

    // Success reply carrying BND.ADDR/BND.PORT
    let mut reply = vec![SOCKS_VERSION, Reply::Succeeded as u8, 0x00, ATYP_IPV4];
    match bound {
        SocketAddr::V4(v4) => {
            reply.extend_from_slice(&v4.ip().octets());
            reply.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(_) => {
            return Err(IngressError::BadRequest(
                "udp associate bound to unexpected address family".to_string(),
            ))
        }
    }
    stream.write_all(&reply).await?;

    let cid = Uuid::new_v4().to_string();
    let assoc = UdpAssociation::new(cid.clone(), socket, Arc::clone(&pool));

    let signal = pool.register_udp(&cid, assoc.clone())?;
    assoc.set_connected_signal(signal);
    assoc.spawn_relay();

    // Per RFC 1928 the association lives exactly as long as the TCP
    // control connection.
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    debug!(%cid, %peer, "control connection closed, ending udp association");
    assoc.shutdown().await;
    Ok(())
}
