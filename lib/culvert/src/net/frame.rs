use crate::net::shared::{
    ErrorType, Key, NetworkError, NetworkResult, DATA_BUF_SIZE, HEADER_SIZE, PKG_BUF_SIZE,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sluice::crypt::Cipher;
use std::io::{self, Cursor, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

/// Commands carried in the frame header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Cmd {
    Conn = 1,
    Data = 2,
    Close = 3,
}

impl Cmd {
    #[inline]
    fn from_wire(raw: u8) -> NetworkResult<Cmd> {
        match raw {
            1 => Ok(Cmd::Conn),
            2 => Ok(Cmd::Data),
            3 => Ok(Cmd::Close),
            _ => Err(NetworkError::Fatal(ErrorType::BadCommand)),
        }
    }
}

/// One multiplexed packet: a session key, a command and an optional payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Pkg {
    pub key: Key,
    pub cmd: Cmd,
    pub data: Vec<u8>,
}

impl Pkg {
    /// A `Conn` or `Close` packet; the payload stays empty.
    #[inline]
    pub fn control(key: Key, cmd: Cmd) -> Pkg {
        Pkg {
            key,
            cmd,
            data: Vec::new(),
        }
    }

    /// A `Data` packet carrying a copy of `buf`.
    #[inline]
    pub fn data(key: Key, buf: &[u8]) -> Pkg {
        Pkg {
            key,
            cmd: Cmd::Data,
            data: buf.to_vec(),
        }
    }
}

/// Serializes, obfuscates and writes one frame with full-write semantics.
/// A failure is reported to the caller and does not tear the carrier down
/// by itself; a short write desynchronizes the codec, so the peer's next
/// read ends the carrier instead.
pub fn send_pkg(stream: &mut TcpStream, cipher: &mut Cipher, pkg: &Pkg) -> NetworkResult<()> {
    if HEADER_SIZE + pkg.data.len() > PKG_BUF_SIZE {
        panic!("send_pkg frame overflow: {} payload bytes", pkg.data.len());
    }

    let mut buf = [0u8; PKG_BUF_SIZE];
    let total = {
        let mut cursor = Cursor::new(&mut buf[..]);
        cursor.write_u64::<LittleEndian>(pkg.key)?;
        cursor.write_u8(pkg.cmd as u8)?;
        cursor.write_u32::<LittleEndian>(pkg.data.len() as u32)?;
        cursor.write_all(&pkg.data)?;
        cursor.position() as usize
    };

    cipher.encode(&mut buf[..total]);
    stream.write_all(&buf[..total]).map_err(Into::into)
}

/// Reads one frame, waiting at most roughly `timeout` for the first byte.
/// `Wait` means no data arrived inside the window; anything that fails
/// mid-frame is fatal since the codec state cannot be resynchronized.
pub fn recv_pkg(stream: &mut TcpStream, cipher: &mut Cipher, timeout: Duration) -> NetworkResult<Pkg> {
    wait_readable(stream, timeout)?;

    let mut header = [0u8; HEADER_SIZE];
    read_frame_exact(stream, &mut header)?;
    cipher.decode(&mut header);

    let mut cursor = Cursor::new(&header[..]);
    let key = cursor.read_u64::<LittleEndian>()?;
    let cmd = Cmd::from_wire(cursor.read_u8()?)?;
    let data_len = cursor.read_u32::<LittleEndian>()? as usize;

    if data_len > DATA_BUF_SIZE {
        return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
    }

    let mut data = vec![0u8; data_len];
    if data_len > 0 {
        read_frame_exact(stream, &mut data)?;
        cipher.decode(&mut data);
    }

    Ok(Pkg { key, cmd, data })
}

/// Emulates a readiness poll with a non-blocking peek: probe, sleep out
/// the window, probe once more.
fn wait_readable(stream: &mut TcpStream, timeout: Duration) -> NetworkResult<()> {
    let mut probe = [0u8; 1];

    stream.set_nonblocking(true)?;
    let mut outcome = peek(stream, &mut probe);
    if let Err(NetworkError::Wait) = outcome {
        thread::sleep(timeout);
        outcome = peek(stream, &mut probe);
    }
    stream.set_nonblocking(false)?;

    outcome
}

fn peek(stream: &TcpStream, probe: &mut [u8; 1]) -> NetworkResult<()> {
    match stream.peek(probe) {
        Ok(0) => Err(NetworkError::Fatal(ErrorType::Closed)),
        Ok(_) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// `read_exact` with mid-frame stalls promoted to fatal errors: once a
/// frame has started, a timeout means the carrier is broken.
fn read_frame_exact(stream: &mut TcpStream, buf: &mut [u8]) -> NetworkResult<()> {
    stream.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => NetworkError::Fatal(ErrorType::Closed),
        kind => NetworkError::Fatal(ErrorType::Io(kind)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::net::TcpListener;

    const POLL: Duration = Duration::from_millis(10);

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_pkg_roundtrip() {
        let (mut tx, mut rx) = socket_pair();
        let mut enc = Cipher::new();
        let mut dec = Cipher::new();
        let mut rng = StdRng::seed_from_u64(42);

        let payload: Vec<u8> = (0..DATA_BUF_SIZE).map(|_| rng.gen()).collect();
        let pkgs = vec![
            Pkg::control(7, Cmd::Conn),
            Pkg::data(7, b"hello"),
            Pkg::data(0xdead_beef_0000_0001, &payload),
            Pkg::control(7, Cmd::Close),
        ];

        for pkg in &pkgs {
            send_pkg(&mut tx, &mut enc, pkg).unwrap();
        }

        for pkg in &pkgs {
            let received = recv_pkg(&mut rx, &mut dec, POLL).unwrap();
            assert_eq!(&received, pkg);
        }
    }

    #[test]
    fn test_recv_timeout() {
        let (_tx, mut rx) = socket_pair();
        let mut dec = Cipher::new();

        let result = recv_pkg(&mut rx, &mut dec, POLL);
        assert_eq!(result, Err(NetworkError::Wait));
    }

    #[test]
    fn test_recv_peer_close() {
        let (tx, mut rx) = socket_pair();
        let mut dec = Cipher::new();

        drop(tx);
        let result = recv_pkg(&mut rx, &mut dec, POLL);
        assert_eq!(result, Err(NetworkError::Fatal(ErrorType::Closed)));
    }

    #[test]
    fn test_recv_bad_command() {
        let (mut tx, mut rx) = socket_pair();
        let mut enc = Cipher::new();
        let mut dec = Cipher::new();

        let mut header = [0u8; HEADER_SIZE];
        {
            let mut cursor = Cursor::new(&mut header[..]);
            cursor.write_u64::<LittleEndian>(1).unwrap();
            cursor.write_u8(9).unwrap();
            cursor.write_u32::<LittleEndian>(0).unwrap();
        }
        enc.encode(&mut header);
        tx.write_all(&header).unwrap();

        let result = recv_pkg(&mut rx, &mut dec, POLL);
        assert_eq!(result, Err(NetworkError::Fatal(ErrorType::BadCommand)));
    }

    #[test]
    fn test_recv_oversized_frame() {
        let (mut tx, mut rx) = socket_pair();
        let mut enc = Cipher::new();
        let mut dec = Cipher::new();

        let mut header = [0u8; HEADER_SIZE];
        {
            let mut cursor = Cursor::new(&mut header[..]);
            cursor.write_u64::<LittleEndian>(1).unwrap();
            cursor.write_u8(Cmd::Data as u8).unwrap();
            cursor.write_u32::<LittleEndian>((DATA_BUF_SIZE + 1) as u32).unwrap();
        }
        enc.encode(&mut header);
        tx.write_all(&header).unwrap();

        let result = recv_pkg(&mut rx, &mut dec, POLL);
        assert_eq!(result, Err(NetworkError::Fatal(ErrorType::PayloadTooLarge)));
    }

    #[test]
    #[should_panic(expected = "frame overflow")]
    fn test_send_overflow_panics() {
        let (mut tx, _rx) = socket_pair();
        let mut enc = Cipher::new();

        let pkg = Pkg::data(1, &vec![0u8; PKG_BUF_SIZE]);
        let _ = send_pkg(&mut tx, &mut enc, &pkg);
    }
}
