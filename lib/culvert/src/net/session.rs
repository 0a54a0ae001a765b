use crate::net::addr::{self, Address};
use crate::net::channel::Channel;
use crate::net::frame::{Cmd, Pkg};
use crate::net::reader::SessionIo;
use crate::net::shared::{ErrorType, Key, NetworkError, NetworkResult, DATA_BUF_SIZE, EGRESS_KEY};
use crate::net::socks;
use sluice::logging::{self, Logger};
use sluice::time::timestamp_secs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cadences of one session worker. Defaults follow the production clocks;
/// tests shrink them.
#[derive(Debug, Copy, Clone)]
pub struct SessionConfig {
    /// Socket recv timeout inside the forwarding loop.
    pub recv_timeout: Duration,
    /// Mailbox poll cadence of the buffered reader.
    pub poll_interval: Duration,
    /// A session with no traffic in either direction for this long is dead.
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            recv_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Session worker for one accepted SOCKS5 client: mint the key, announce
/// the session over the carrier and bridge until either side ends it.
pub fn run_ingress_session(
    channel: &Arc<Channel>,
    stream: TcpStream,
    config: &SessionConfig,
    log: &Logger,
) {
    let peer = match stream.peer_addr().ok().and_then(Address::from_std) {
        Some(peer) => peer,
        None => {
            logging::error!(log, "client socket has no IPv4 peer address");
            return;
        }
    };

    let key = addr::make_key(&peer, timestamp_secs());
    let _claim = match channel.claim(key) {
        Some(claim) => claim,
        None => panic!("session key conflict: {}", key),
    };

    let log = log.new(logging::o!("key" => key));
    logging::info!(log, "session start"; "peer" => %peer);

    channel.push(EGRESS_KEY, Pkg::control(key, Cmd::Conn));

    let mut io = SessionIo::new(
        channel.clone(),
        key,
        config.poll_interval,
        config.idle_timeout,
        &log,
    );
    let result = forward(&mut io, stream, config, &log);

    logging::info!(log, "session exit"; "result" => ?result);
}

/// Session worker on the egress peer. The originator is reachable only
/// through the session mailbox: speak SOCKS5 over the buffered reader,
/// open the destination socket, then bridge like the ingress worker.
pub fn run_egress_session(channel: &Arc<Channel>, key: Key, config: &SessionConfig, log: &Logger) {
    let _claim = match channel.claim(key) {
        Some(claim) => claim,
        None => panic!("session key conflict: {}", key),
    };

    let log = log.new(logging::o!("key" => key));
    logging::info!(log, "session start");

    let mut io = SessionIo::new(
        channel.clone(),
        key,
        config.poll_interval,
        config.idle_timeout,
        &log,
    );

    if socks::handshake(&mut io, &log).is_err() {
        logging::error!(log, "handshake failed");
        io.write_close();
        return;
    }

    let stream = match socks::connect_command(&mut io, &log) {
        Ok(stream) => stream,
        Err(err) => {
            logging::error!(log, "connect command failed"; "error" => ?err);
            io.write_close();
            return;
        }
    };

    let result = forward(&mut io, stream, config, &log);
    logging::info!(log, "session exit"; "result" => ?result);
}

/// The bidirectional bridge: raw socket bytes become `Data` packets for
/// the carrier, mailbox packets become raw socket writes. Runs until peer
/// close, `Close` delivery, a socket error or the idle timeout.
fn forward(
    io: &mut SessionIo,
    mut stream: TcpStream,
    config: &SessionConfig,
    log: &Logger,
) -> NetworkResult<()> {
    stream.set_read_timeout(Some(config.recv_timeout))?;

    let mut buf = [0u8; DATA_BUF_SIZE];
    let mut last_active = Instant::now();

    loop {
        // Socket to carrier.
        match stream.read(&mut buf) {
            Ok(0) => {
                logging::info!(log, "socket closed by peer");
                io.write_close();
                return Ok(());
            }
            Ok(len) => {
                logging::debug!(log, "socket data"; "len" => len);
                io.write(&buf[..len]);
                last_active = Instant::now();
            }
            Err(err) => match NetworkError::from(err) {
                NetworkError::Wait => {}
                fatal => {
                    logging::info!(log, "socket recv error"; "error" => ?fatal);
                    io.write_close();
                    return Err(fatal);
                }
            },
        }

        // Mailbox to socket.
        loop {
            match io.read_data() {
                Ok(data) => {
                    last_active = Instant::now();
                    if let Err(err) = stream.write_all(&data) {
                        logging::error!(log, "socket send error"; "error" => %err);
                        io.write_close();
                        return Err(err.into());
                    }
                }
                Err(NetworkError::Wait) => break,
                // Close delivery is the normal end of a session; the far
                // side is already gone, so no counterpart Close is emitted.
                Err(NetworkError::Fatal(ErrorType::Closed)) => return Ok(()),
                Err(err) => return Err(err),
            }
        }

        if last_active.elapsed() > config.idle_timeout {
            logging::error!(log, "session idle timeout");
            return Err(NetworkError::Fatal(ErrorType::Expired));
        }
    }
}
