//! The SOCKS5 state machine the egress worker drives over a session
//! mailbox. Only the subset the tunnel needs: method negotiation, CONNECT
//! with IPv4 or domain targets, replies in the 10-byte IPv4 form.

use crate::net::addr::{self, Address};
use crate::net::reader::SessionIo;
use crate::net::shared::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, WriteBytesExt};
use sluice::logging::{self, Logger};
use std::net::{Ipv4Addr, TcpStream};

pub const VERSION: u8 = 5;

const METHOD_NO_AUTH: u8 = 0;
const CMD_CONNECT: u8 = 1;
const ATYP_V4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const REPLY_OK: u8 = 0;
const REPLY_FAILURE: u8 = 1;

/// Runs method negotiation. Offered methods are logged, not validated; the
/// reply always selects NO AUTH.
pub fn handshake(io: &mut SessionIo, log: &Logger) -> NetworkResult<()> {
    let ver = io.read_u8()?;
    let method_count = io.read_u8()?;
    logging::info!(log, "handshake request"; "ver" => ver, "methods" => method_count);

    for _ in 0..method_count {
        let method = io.read_u8()?;
        logging::debug!(log, "offered method"; "method" => method);
    }

    io.write(&[ver, METHOD_NO_AUTH]);
    Ok(())
}

/// Parses the CONNECT request and opens the destination socket. Every
/// rejection emits a failure reply and returns immediately; no success
/// reply can follow a failure reply.
pub fn connect_command(io: &mut SessionIo, log: &Logger) -> NetworkResult<TcpStream> {
    let ver = io.read_u8()?;
    let cmd = io.read_u8()?;
    let rsv = io.read_u8()?;
    let atyp = io.read_u8()?;
    logging::info!(log, "command request"; "ver" => ver, "cmd" => cmd, "rsv" => rsv, "atyp" => atyp);

    if cmd != CMD_CONNECT {
        logging::error!(log, "unsupported command"; "cmd" => cmd);
        command_reply(io, REPLY_FAILURE, None);
        return Err(NetworkError::Fatal(ErrorType::Handshake));
    }
    if rsv != 0 {
        logging::error!(log, "nonzero reserved byte"; "rsv" => rsv);
        command_reply(io, REPLY_FAILURE, None);
        return Err(NetworkError::Fatal(ErrorType::Handshake));
    }

    let ip = match atyp {
        ATYP_V4 => Ipv4Addr::from(io.read_u32_be()?),
        ATYP_DOMAIN => {
            let len = io.read_u8()? as usize;
            let mut name = vec![0u8; len];
            io.read_exact(&mut name)?;
            let host = String::from_utf8_lossy(&name).into_owned();
            logging::info!(log, "resolving target"; "host" => &host);

            match addr::resolve(&host) {
                Ok(ip) => ip,
                Err(err) => {
                    logging::error!(log, "target did not resolve"; "host" => &host);
                    command_reply(io, REPLY_FAILURE, None);
                    return Err(err);
                }
            }
        }
        other => {
            logging::error!(log, "unsupported address type"; "atyp" => other);
            command_reply(io, REPLY_FAILURE, None);
            return Err(NetworkError::Fatal(ErrorType::Handshake));
        }
    };

    let port = io.read_u16_be()?;
    let target = Address::V4(ip, port);
    logging::info!(log, "connecting to target"; "target" => %target);

    let stream = match TcpStream::connect(target.socket_addr()) {
        Ok(stream) => stream,
        Err(err) => {
            logging::error!(log, "target connect failed"; "target" => %target, "error" => %err);
            command_reply(io, REPLY_FAILURE, None);
            return Err(NetworkError::Fatal(ErrorType::Io(err.kind())));
        }
    };

    let bind = stream
        .local_addr()
        .ok()
        .and_then(Address::from_std)
        .unwrap_or(Address::V4(Ipv4Addr::UNSPECIFIED, 0));
    command_reply(io, REPLY_OK, Some(&bind));

    Ok(stream)
}

/// Emits the standard 10-byte IPv4-form reply. Without a bind address the
/// address and port fields stay zero.
pub fn command_reply(io: &SessionIo, reply: u8, bind: Option<&Address>) {
    let mut buf = [0u8; 10];
    buf[0] = VERSION;
    buf[1] = reply;
    buf[2] = 0;
    buf[3] = ATYP_V4;

    if let Some(bind) = bind {
        buf[4..8].copy_from_slice(&bind.octets());
        (&mut buf[8..10])
            .write_u16::<BigEndian>(bind.port())
            .expect("reply buffer is sized for the address");
    }

    io.write(&buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::channel::Channel;
    use crate::net::frame::{Cmd, Pkg};
    use crate::net::shared::{Key, EGRESS_KEY};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::time::Duration;

    const KEY: Key = 77;

    fn session_io() -> (Arc<Channel>, SessionIo, Logger) {
        let channel = Arc::new(Channel::new(None));
        let log = Logger::root(logging::Discard, logging::o!());
        let io = SessionIo::new(
            channel.clone(),
            KEY,
            Duration::from_millis(10),
            Duration::from_secs(5),
            &log,
        );
        (channel, io, log)
    }

    fn pop_reply(channel: &Channel) -> Vec<u8> {
        let pkg = channel.pop(EGRESS_KEY).unwrap();
        assert_eq!(pkg.key, KEY);
        assert_eq!(pkg.cmd, Cmd::Data);
        pkg.data
    }

    #[test]
    fn test_handshake_selects_no_auth() {
        let (channel, mut io, log) = session_io();

        channel.push(KEY, Pkg::data(KEY, &[5, 2, 0, 2]));
        handshake(&mut io, &log).unwrap();

        assert_eq!(pop_reply(&channel), [5, 0]);
    }

    #[test]
    fn test_connect_ipv4_happy_path() {
        let (channel, mut io, log) = session_io();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap();

        let mut request = vec![5, 1, 0, 1, 127, 0, 0, 1];
        request.extend_from_slice(&target.port().to_be_bytes());
        channel.push(KEY, Pkg::data(KEY, &request));

        let stream = connect_command(&mut io, &log).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), target);

        let reply = pop_reply(&channel);
        assert_eq!(reply.len(), 10);
        assert_eq!(&reply[..4], &[5, 0, 0, 1]);

        // Exactly one reply.
        assert!(channel.pop(EGRESS_KEY).is_none());
    }

    #[test]
    fn test_connect_domain_resolves() {
        let (channel, mut io, log) = session_io();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap();

        let mut request = vec![5, 1, 0, 3, 9];
        request.extend_from_slice(b"localhost");
        request.extend_from_slice(&target.port().to_be_bytes());
        channel.push(KEY, Pkg::data(KEY, &request));

        let stream = connect_command(&mut io, &log).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), target);
        assert_eq!(pop_reply(&channel)[1], 0);
    }

    #[test]
    fn test_unsupported_command_rejected() {
        let (channel, mut io, log) = session_io();

        // CMD = 2 is BIND, which the tunnel does not speak.
        channel.push(KEY, Pkg::data(KEY, &[5, 2, 0, 1, 0, 0, 0, 0, 0, 0]));

        assert!(connect_command(&mut io, &log).is_err());
        assert_eq!(pop_reply(&channel)[1], 1);
        assert!(channel.pop(EGRESS_KEY).is_none());
    }

    #[test]
    fn test_unsupported_atyp_rejected() {
        let (channel, mut io, log) = session_io();

        // ATYP = 4 would be IPv6.
        channel.push(KEY, Pkg::data(KEY, &[5, 1, 0, 4]));

        assert!(connect_command(&mut io, &log).is_err());
        assert_eq!(pop_reply(&channel)[1], 1);
    }

    #[test]
    fn test_connect_failure_single_reply() {
        let (channel, mut io, log) = session_io();

        // Grab a port that refuses connections.
        let refused = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut request = vec![5, 1, 0, 1, 127, 0, 0, 1];
        request.extend_from_slice(&refused.to_be_bytes());
        channel.push(KEY, Pkg::data(KEY, &request));

        assert!(connect_command(&mut io, &log).is_err());

        // The failure reply is the only reply.
        assert_eq!(pop_reply(&channel)[1], 1);
        assert!(channel.pop(EGRESS_KEY).is_none());
    }

    #[test]
    fn test_resolve_failure_rejected() {
        let (channel, mut io, log) = session_io();

        let mut request = vec![5, 1, 0, 3, 20];
        request.extend_from_slice(b"no-such-host.invalid");
        channel.push(KEY, Pkg::data(KEY, &request));

        assert!(connect_command(&mut io, &log).is_err());
        assert_eq!(pop_reply(&channel)[1], 1);
        assert!(channel.pop(EGRESS_KEY).is_none());
    }
}
