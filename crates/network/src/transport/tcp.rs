//! Clear-net transport over TCP with u32 big-endian length prefixed frames.

use super::{FrameSink, FrameStream, Listening, RawLink, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use peernet_types::{Address, TransportType};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;
const ACCEPT_CAPACITY: usize = 64;

pub struct TcpTransport {
    max_frame_bytes: usize,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            accept_tasks: Mutex::new(Vec::new()),
        }
    }
}

fn framed(stream: TcpStream, remote: Address, max_frame_bytes: usize) -> io::Result<RawLink> {
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    Ok(RawLink {
        remote,
        sink: Box::new(TcpSink { write }),
        stream: Box::new(TcpFrameStream {
            read,
            max_frame_bytes,
        }),
    })
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Clear
    }

    async fn connect(&self, address: &Address) -> io::Result<RawLink> {
        let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
        framed(stream, address.clone(), self.max_frame_bytes)
    }

    async fn listen(&self, address: &Address) -> io::Result<Listening> {
        let listener = TcpListener::bind((address.host.as_str(), address.port)).await?;
        let local = listener.local_addr()?;
        let local_address = Address::new(local.ip().to_string(), local.port());
        let (tx, rx) = mpsc::channel(ACCEPT_CAPACITY);
        let max_frame_bytes = self.max_frame_bytes;

        info!("Listening for TCP connections on {}", local_address);

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        let remote = Address::new(peer_addr.ip().to_string(), peer_addr.port());
                        let link = match framed(socket, remote, max_frame_bytes) {
                            Ok(link) => link,
                            Err(e) => {
                                error!("Failed to configure socket from {}: {}", peer_addr, e);
                                continue;
                            }
                        };
                        if tx.send(link).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }
        });
        self.accept_tasks.lock().push(task);

        Ok(Listening {
            local_address,
            incoming: rx,
        })
    }

    async fn close(&self) {
        for task in self.accept_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

struct TcpSink {
    write: OwnedWriteHalf,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let len = u32::try_from(frame.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
        self.write.write_all(&len.to_be_bytes()).await?;
        self.write.write_all(frame).await?;
        self.write.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.write.shutdown().await
    }
}

struct TcpFrameStream {
    read: OwnedReadHalf,
    max_frame_bytes: usize,
}

#[async_trait]
impl FrameStream for TcpFrameStream {
    async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match self.read.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_frame_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit of {}", len, self.max_frame_bytes),
            ));
        }

        let mut data = vec![0u8; len];
        self.read.read_exact(&mut data).await?;
        Ok(Some(data))
    }
}
