use crate::net::channel::Channel;
use crate::net::frame::{Cmd, Pkg};
use crate::net::shared::{ErrorType, Key, NetworkError, NetworkResult, EGRESS_KEY};
use byteorder::{BigEndian, ReadBytesExt};
use sluice::logging::{self, Logger};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Buffered reader/writer pair over one session mailbox. The egress worker
/// speaks SOCKS5 through this before it has a destination socket; once
/// forwarding starts, the non-blocking `read_data` side takes over,
/// including whatever suffix of the current packet the handshake left
/// unconsumed.
pub struct SessionIo {
    channel: Arc<Channel>,
    key: Key,
    pending: Option<Pkg>,
    read_pos: usize,
    poll_interval: Duration,
    idle_timeout: Duration,
    log: Logger,
}

impl SessionIo {
    pub fn new(
        channel: Arc<Channel>,
        key: Key,
        poll_interval: Duration,
        idle_timeout: Duration,
        log: &Logger,
    ) -> SessionIo {
        SessionIo {
            channel,
            key,
            pending: None,
            read_pos: 0,
            poll_interval,
            idle_timeout,
            log: log.new(logging::o!()),
        }
    }

    #[inline]
    pub fn key(&self) -> Key {
        self.key
    }

    /// Fills `buf` exactly, blocking on the mailbox poll cadence. Fails on
    /// `Close`, on protocol garbage and after `idle_timeout` without
    /// traffic.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> NetworkResult<()> {
        let mut wpos = 0;
        let mut last_active = Instant::now();

        while wpos < buf.len() {
            while self.buffered().is_empty() {
                match self.next_pkg() {
                    Ok(()) => {
                        last_active = Instant::now();
                    }
                    Err(NetworkError::Wait) => {
                        if last_active.elapsed() > self.idle_timeout {
                            logging::error!(self.log, "session stalled waiting for data"; "key" => self.key);
                            return Err(NetworkError::Fatal(ErrorType::Expired));
                        }
                        thread::sleep(self.poll_interval);
                    }
                    Err(err) => return Err(err),
                }
            }

            let chunk = self.buffered();
            let copy_len = chunk.len().min(buf.len() - wpos);
            buf[wpos..wpos + copy_len].copy_from_slice(&chunk[..copy_len]);
            wpos += copy_len;
            self.read_pos += copy_len;
        }

        Ok(())
    }

    pub fn read_u8(&mut self) -> NetworkResult<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads a network-order u16 (SOCKS5 port fields).
    pub fn read_u16_be(&mut self) -> NetworkResult<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        (&buf[..]).read_u16::<BigEndian>().map_err(Into::into)
    }

    /// Reads a network-order u32 (SOCKS5 IPv4 fields).
    pub fn read_u32_be(&mut self) -> NetworkResult<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        (&buf[..]).read_u32::<BigEndian>().map_err(Into::into)
    }

    /// Non-blocking read of the next payload: the unconsumed suffix of the
    /// buffered packet, or the next whole `Data` packet. `Wait` when the
    /// mailbox is empty.
    pub fn read_data(&mut self) -> NetworkResult<Vec<u8>> {
        if self.buffered().is_empty() {
            self.next_pkg()?;
        }

        let pkg = self.pending.take().expect("a packet was just buffered");
        let data = if self.read_pos == 0 {
            pkg.data
        } else {
            pkg.data[self.read_pos..].to_vec()
        };
        self.read_pos = 0;

        Ok(data)
    }

    /// Queues `buf` for the carrier as a `Data` packet from this session.
    pub fn write(&self, buf: &[u8]) {
        self.channel.push(EGRESS_KEY, Pkg::data(self.key, buf));
    }

    /// Queues this session's `Close` notice for the carrier.
    pub fn write_close(&self) {
        self.channel.push(EGRESS_KEY, Pkg::control(self.key, Cmd::Close));
    }

    /// Unconsumed slice of the buffered packet.
    #[inline]
    fn buffered(&self) -> &[u8] {
        match &self.pending {
            Some(pkg) => &pkg.data[self.read_pos..],
            None => &[],
        }
    }

    /// Pulls the next packet off the mailbox. `Wait` when the mailbox is
    /// empty; `Close` and anything but `Data` end the session.
    fn next_pkg(&mut self) -> NetworkResult<()> {
        let pkg = match self.channel.pop(self.key) {
            Some(pkg) => pkg,
            None => return Err(NetworkError::Wait),
        };

        match pkg.cmd {
            Cmd::Data => {
                self.pending = Some(pkg);
                self.read_pos = 0;
                Ok(())
            }
            Cmd::Close => {
                logging::info!(self.log, "session closed by peer"; "key" => self.key);
                Err(NetworkError::Fatal(ErrorType::Closed))
            }
            Cmd::Conn => {
                logging::error!(self.log, "unexpected command in session mailbox"; "key" => self.key);
                Err(NetworkError::Fatal(ErrorType::BadCommand))
            }
        }
    }
}
