//! Service-file control protocol
//!
//! Service scripts describe a service by sending requests, either over the
//! control socket or over the pipe the daemon hands them on fd 3. Each message
//! is MessagePack in a frame prefixed with its length as a big-endian `u32`.

use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::sys::stat::{fstat, SFlag};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame payload
pub const MAX_FRAME: usize = 64 * 1024;

/// Descriptor number service scripts find the daemon on
pub const SETUP_FD: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub version: u32,
    pub body: RequestBody,
}

impl Request {
    pub fn new(body: RequestBody) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody {
    /// Create (or take over a parsing) service of a type
    CreateService {
        service_type: String,
        name: String,
        origin: String,
    },
    SetVariable {
        service: String,
        var_type: String,
        var_name: Option<String>,
        value: Option<String>,
    },
    GetVariable {
        service: String,
        var_type: String,
        var_name: Option<String>,
    },
    /// The description is complete, start it
    Done { service: String },
    /// The description failed
    Abort { service: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    pub message: String,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Frame of {0} bytes is too large")]
    FrameTooLarge(usize),

    #[error("Bad protocol version")]
    Version { expected: u32, found: u32 },
}

/// Serialize `msg` into one length-prefixed frame
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = rmp_serde::to_vec(msg)?;
    if payload.len() > MAX_FRAME {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Take one complete frame off the front of `buf`
///
/// Returns `Ok(None)` while the frame is still incomplete. A frame that fails
/// to decode is consumed anyway so the stream can resync on the next one.
pub fn take_frame<T: DeserializeOwned>(buf: &mut Vec<u8>) -> Result<Option<T>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME {
        buf.clear();
        return Err(ProtocolError::FrameTooLarge(len));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }

    let frame: Vec<u8> = buf.drain(..4 + len).collect();
    Ok(Some(rmp_serde::from_slice(&frame[4..])?))
}

/// Refuse requests from a different protocol version
pub fn check_version(request: &Request) -> Result<(), ProtocolError> {
    if request.version != PROTOCOL_VERSION {
        return Err(ProtocolError::Version {
            expected: PROTOCOL_VERSION,
            found: request.version,
        });
    }
    Ok(())
}

pub fn write_message<W: Write, T: Serialize>(w: &mut W, msg: &T) -> Result<(), ProtocolError> {
    w.write_all(&encode(msg)?)?;
    w.flush()?;
    Ok(())
}

pub fn read_message<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T, ProtocolError> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(rmp_serde::from_slice(&payload)?)
}

pub async fn read_message_async<R, T>(r: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(rmp_serde::from_slice(&payload)?)
}

pub async fn write_message_async<W, T>(w: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    w.write_all(&encode(msg)?).await?;
    w.flush().await?;
    Ok(())
}

/// Send one request over `stream` and wait for the reply
pub fn call<S: Read + Write>(stream: &mut S, request: &Request) -> Result<Reply, ProtocolError> {
    write_message(stream, request)?;
    read_message(stream)
}

/// Connect to the control socket and make one request
pub fn call_socket(path: &Path, request: &Request) -> Result<Reply, ProtocolError> {
    let mut stream = UnixStream::connect(path)?;
    call(&mut stream, request)
}

/// Whether `fd` is open and a socket
pub fn is_socket(fd: RawFd) -> bool {
    fstat(fd).is_ok_and(|st| SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT == SFlag::S_IFSOCK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let requests = vec![
            Request::new(RequestBody::CreateService {
                service_type: "daemon".into(),
                name: "daemon/sshd".into(),
                origin: "/etc/initng/daemon".into(),
            }),
            Request::new(RequestBody::SetVariable {
                service: "getty/tty1".into(),
                var_type: "exec".into(),
                var_name: None,
                value: Some("/sbin/agetty tty1".into()),
            }),
            Request::new(RequestBody::Done {
                service: "getty/tty1".into(),
            }),
        ];

        for req in requests {
            let mut buf = encode(&req).unwrap();
            let decoded: Request = take_frame(&mut buf).unwrap().unwrap();
            assert_eq!(req, decoded);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn take_frame_waits_for_complete_frame() {
        let frame = encode(&Reply::fail("Duplet found.")).unwrap();
        let mut buf = frame[..frame.len() - 1].to_vec();
        assert!(take_frame::<Reply>(&mut buf).unwrap().is_none());

        buf.push(*frame.last().unwrap());
        buf.extend_from_slice(&encode(&Reply::ok()).unwrap());

        let first: Reply = take_frame(&mut buf).unwrap().unwrap();
        let second: Reply = take_frame(&mut buf).unwrap().unwrap();
        assert_eq!(first.message, "Duplet found.");
        assert!(second.success);
        assert!(take_frame::<Reply>(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = ((MAX_FRAME + 1) as u32).to_be_bytes().to_vec();
        assert!(matches!(
            take_frame::<Reply>(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn garbage_frame_is_consumed() {
        let mut buf = vec![0, 0, 0, 2, 0xc1, 0xc1];
        buf.extend_from_slice(&encode(&Reply::ok()).unwrap());
        assert!(take_frame::<Reply>(&mut buf).is_err());
        assert!(take_frame::<Reply>(&mut buf).unwrap().unwrap().success);
    }

    #[test]
    fn version_check() {
        let mut req = Request::new(RequestBody::Abort { service: "x".into() });
        assert!(check_version(&req).is_ok());
        req.version = 7;
        let err = check_version(&req).unwrap_err();
        assert_eq!(err.to_string(), "Bad protocol version");
    }

    #[test]
    fn call_over_socketpair() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || {
            let req: Request = read_message(&mut server).unwrap();
            assert!(matches!(req.body, RequestBody::Done { .. }));
            write_message(&mut server, &Reply::ok_with("started")).unwrap();
        });

        let reply = call(
            &mut client,
            &Request::new(RequestBody::Done {
                service: "getty/tty1".into(),
            }),
        )
        .unwrap();
        handle.join().unwrap();
        assert_eq!(reply, Reply::ok_with("started"));
    }

    #[test]
    fn async_roundtrip() {
        tokio_test::block_on(async {
            let (mut a, mut b) = tokio::net::UnixStream::pair().unwrap();
            write_message_async(&mut a, &Reply::fail("Service missing.")).await.unwrap();
            let reply: Reply = read_message_async(&mut b).await.unwrap();
            assert_eq!(reply.message, "Service missing.");
        });
    }

    #[test]
    fn setup_fd_detection() {
        use std::os::fd::AsRawFd;

        let (a, _b) = UnixStream::pair().unwrap();
        assert!(is_socket(a.as_raw_fd()));

        let null = std::fs::File::open("/dev/null").unwrap();
        assert!(!is_socket(null.as_raw_fd()));
        assert!(!is_socket(-1));
    }
}
