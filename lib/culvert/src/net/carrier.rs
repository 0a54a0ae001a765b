use crate::net::channel::Channel;
use crate::net::frame::{self, Cmd, Pkg};
use crate::net::session::{self, SessionConfig};
use crate::net::shared::{ErrorUtils, NetworkError, NetworkResult, EGRESS_KEY};
use sluice::crypt::Cipher;
use sluice::logging::{self, Logger};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Which role drives session creation over this carrier.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    /// Sessions are created by the local accept loop; `Conn` packets never
    /// arrive from the carrier.
    Ingress,
    /// Every `Conn` packet spawns a session worker; owns the GC clock.
    Egress,
}

/// Cadences of the carrier worker and its enclosing driver loops.
#[derive(Debug, Copy, Clone)]
pub struct CarrierConfig {
    /// Polling window of one `recv_pkg` attempt.
    pub poll_timeout: Duration,
    /// Carrier-level socket read timeout; a frame stalled for longer is
    /// fatal.
    pub read_timeout: Duration,
    /// Delay between ingress redial attempts.
    pub reconnect_delay: Duration,
    /// Minimum spacing between GC sweeps.
    pub gc_interval: Duration,
    /// Idle threshold beyond which a dangling mailbox is reaped.
    pub gc_max_idle: Duration,
    pub session: SessionConfig,
}

impl Default for CarrierConfig {
    fn default() -> CarrierConfig {
        CarrierConfig {
            poll_timeout: Duration::from_millis(50),
            read_timeout: Duration::from_secs(600),
            reconnect_delay: Duration::from_secs(1),
            gc_interval: Duration::from_secs(60),
            gc_max_idle: Duration::from_secs(120),
            session: SessionConfig::default(),
        }
    }
}

/// The single worker bridging one peer's channel with the carrier socket.
/// Owns the obfuscator pair; codec state lives and dies with the
/// connection.
pub struct Carrier {
    stream: TcpStream,
    channel: Arc<Channel>,
    role: Role,
    config: CarrierConfig,
    enc: Cipher,
    dec: Cipher,
    last_gc: Instant,
    log: Logger,
}

impl Carrier {
    pub fn new(
        stream: TcpStream,
        channel: Arc<Channel>,
        role: Role,
        config: CarrierConfig,
        log: &Logger,
    ) -> Carrier {
        Carrier {
            stream,
            channel,
            role,
            config,
            enc: Cipher::new(),
            dec: Cipher::new(),
            last_gc: Instant::now(),
            log: log.new(logging::o!("role" => format!("{:?}", role))),
        }
    }

    /// Runs until the carrier dies. On exit every live session mailbox
    /// gets a synthetic `Close`; sessions cannot outlive the carrier
    /// usefully.
    pub fn run(&mut self) {
        logging::info!(self.log, "carrier worker start");

        match self.stream.set_read_timeout(Some(self.config.read_timeout)) {
            Ok(()) => {
                let result = self.process();
                logging::info!(self.log, "carrier worker exit"; "result" => ?result);
            }
            Err(err) => {
                logging::error!(self.log, "carrier socket setup failed"; "error" => %err);
            }
        }

        self.channel.close_all();
    }

    fn process(&mut self) -> NetworkResult<()> {
        loop {
            match frame::recv_pkg(&mut self.stream, &mut self.dec, self.config.poll_timeout) {
                Ok(pkg) => self.dispatch(pkg),
                Err(NetworkError::Wait) => {
                    logging::trace!(self.log, "carrier poll timeout");
                }
                Err(err) => return Err(err),
            }

            self.drain_egress();

            if self.role == Role::Egress && self.last_gc.elapsed() > self.config.gc_interval {
                self.channel.garbage_cleanup(self.config.gc_max_idle);
                self.last_gc = Instant::now();
            }
        }
    }

    /// Routes one carrier packet: on the egress peer a `Conn` spawns the
    /// session worker, everything else lands in its session mailbox.
    fn dispatch(&mut self, pkg: Pkg) {
        logging::debug!(self.log, "carrier recv";
                        "key" => pkg.key,
                        "cmd" => ?pkg.cmd,
                        "len" => pkg.data.len());

        if self.role == Role::Egress && pkg.cmd == Cmd::Conn {
            let channel = self.channel.clone();
            let config = self.config.session;
            let key = pkg.key;
            let log = self.log.clone();
            thread::spawn(move || session::run_egress_session(&channel, key, &config, &log));
        } else {
            self.channel.push(pkg.key, pkg);
        }
    }

    /// Flushes everything queued for the carrier. Send failures are logged
    /// and skipped; the next read decides the carrier's fate.
    fn drain_egress(&mut self) {
        while let Some(pkg) = self.channel.pop(EGRESS_KEY) {
            logging::debug!(self.log, "carrier send";
                            "key" => pkg.key,
                            "cmd" => ?pkg.cmd,
                            "len" => pkg.data.len());

            let result = frame::send_pkg(&mut self.stream, &mut self.enc, &pkg);
            if result.has_failed() {
                logging::error!(self.log, "carrier send error"; "key" => pkg.key, "result" => ?result);
            }
        }
    }
}

/// Ingress-side carrier maintenance: dial, run, redial until the process
/// dies. Every (re)connect starts from fresh codec state.
pub fn run_ingress_carrier(
    channel: Arc<Channel>,
    server: SocketAddr,
    config: CarrierConfig,
    log: Logger,
) {
    logging::info!(log, "carrier loop start"; "server" => %server);

    loop {
        match TcpStream::connect(server) {
            Ok(stream) => {
                logging::info!(log, "carrier connected"; "server" => %server);
                Carrier::new(stream, channel.clone(), Role::Ingress, config, &log).run();
                logging::info!(log, "carrier disconnected"; "server" => %server);
            }
            Err(err) => {
                logging::info!(log, "carrier connect failed"; "server" => %server, "error" => %err);
            }
        }

        thread::sleep(config.reconnect_delay);
    }
}

/// Ingress accept loop: every accepted SOCKS5 client becomes a session
/// worker thread. Doubles as this peer's GC clock.
pub fn run_ingress_listener(
    channel: Arc<Channel>,
    listener: TcpListener,
    config: CarrierConfig,
    log: Logger,
) {
    let mut last_gc = Instant::now();

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                logging::info!(log, "client accepted"; "peer" => %peer);
                let channel = channel.clone();
                let session_config = config.session;
                let log = log.clone();
                thread::spawn(move || {
                    session::run_ingress_session(&channel, stream, &session_config, &log)
                });
            }
            Err(err) => {
                logging::error!(log, "client accept error"; "error" => %err);
            }
        }

        if last_gc.elapsed() > config.gc_interval {
            channel.garbage_cleanup(config.gc_max_idle);
            last_gc = Instant::now();
        }
    }
}

/// Egress-side acceptor: every inbound carrier gets its own worker thread
/// and its own channel, so concurrent carriers cannot see each other's
/// sessions.
pub fn run_egress_listener(listener: TcpListener, config: CarrierConfig, log: Logger) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                logging::info!(log, "carrier accepted"; "peer" => %peer);
                let log = log.clone();
                thread::spawn(move || {
                    let channel = Arc::new(Channel::new(&log));
                    Carrier::new(stream, channel, Role::Egress, config, &log).run();
                });
            }
            Err(err) => {
                logging::error!(log, "carrier accept error"; "error" => %err);
            }
        }
    }
}
