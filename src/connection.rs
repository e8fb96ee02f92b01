use crate::codec::FrameCodec;
use crate::config::ClientConfig;
use crate::error::{AvrError, Result};
use crate::protocol::{match_frame, ErrorPolicy, FrameMatch, Request, COMMAND_TERMINATOR};
use futures_util::StreamExt;
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::codec::FramedRead;

const FRAME_BUFFER: usize = 256;
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd"
))]
const KEEPALIVE_PROBES: u32 = 3;

/// Write side of the socket plus the time of the last write
struct Writer {
    stream: OwnedWriteHalf,
    last_command: Option<Instant>,
}

/// Low-level line protocol connection
///
/// The socket is read by exactly one [`FrameReader`]. Every frame it yields is
/// republished through a broadcast channel so that pending requests can look
/// for their answer without a second read racing the first.
pub(crate) struct Connection {
    writer: Mutex<Writer>,
    /// Held for the whole send-and-wait of a request
    request_lock: Mutex<()>,
    frames: broadcast::Sender<String>,
    last_activity: std::sync::Mutex<Instant>,
    timeout: Duration,
    command_delay: Duration,
}

/// Sole reader of the socket's receive side
pub(crate) struct FrameReader {
    frames: FramedRead<OwnedReadHalf, FrameCodec>,
}

impl FrameReader {
    /// Wait for the next frame
    ///
    /// Returns `None` once the stream is closed or fails. Malformed frames
    /// are handled by the codec and never end the stream.
    pub async fn next_frame(&mut self) -> Option<String> {
        match self.frames.next().await {
            Some(Ok(frame)) => Some(frame),
            Some(Err(e)) => {
                tracing::warn!("Failed to read frame: {}", e);
                None
            }
            None => {
                tracing::info!("Receiver closed the connection");
                None
            }
        }
    }
}

impl Connection {
    /// Open a TCP connection to the receiver
    pub async fn open(config: &ClientConfig) -> Result<(Self, FrameReader)> {
        let address = config.address();
        tracing::info!("Connecting to {}", address);

        let stream = match timeout(config.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(AvrError::Connection(e)),
            Err(_) => return Err(AvrError::ConnectTimeout),
        };

        if let Err(e) = configure_keepalive(&stream, config.timeout) {
            tracing::warn!("Failed to enable TCP keepalive: {}", e);
        }

        let (read, write) = stream.into_split();
        let (frames, _) = broadcast::channel(FRAME_BUFFER);

        let connection = Self {
            writer: Mutex::new(Writer {
                stream: write,
                last_command: None,
            }),
            request_lock: Mutex::new(()),
            frames,
            last_activity: std::sync::Mutex::new(Instant::now()),
            timeout: config.timeout,
            command_delay: config.command_delay,
        };
        let reader = FrameReader {
            frames: FramedRead::new(read, FrameCodec::default()),
        };

        tracing::info!("Connected to {}", address);
        Ok((connection, reader))
    }

    /// Hand a frame read by the listener to any pending request
    pub fn publish(&self, frame: String) {
        self.touch();
        // No receivers just means no request is waiting
        let _ = self.frames.send(frame);
    }

    /// Record traffic on the connection
    pub fn touch(&self) {
        *self.activity() = Instant::now();
    }

    /// Time since the last command or frame
    pub fn idle_for(&self) -> Duration {
        self.activity().elapsed()
    }

    /// Write a command line without waiting for a reply
    ///
    /// When `rate_limited`, waits until `command_delay` has passed since the
    /// previous write. The writer lock is held across that wait so commands
    /// leave in call order.
    pub async fn send_raw_command(&self, line: &str, rate_limited: bool) -> Result<()> {
        let mut writer = self.writer.lock().await;

        if rate_limited {
            if let Some(last) = writer.last_command {
                let elapsed = last.elapsed();
                if elapsed < self.command_delay {
                    tokio::time::sleep(self.command_delay - elapsed).await;
                }
            }
        }

        tracing::debug!("Sending: {}", line);
        let data = format!("{}{}", line, COMMAND_TERMINATOR);
        writer.stream.write_all(data.as_bytes()).await?;
        writer.stream.flush().await?;
        writer.last_command = Some(Instant::now());
        drop(writer);

        self.touch();
        Ok(())
    }

    /// Send a command and wait for the frame that answers it
    ///
    /// Returns `Ok(None)` if no answer arrives within the timeout or if the
    /// receiver reports an error and the policy does not raise it.
    pub async fn send_raw_request(
        &self,
        request: &Request,
        rate_limited: bool,
    ) -> Result<Option<String>> {
        let _guard = self.request_lock.lock().await;

        // Subscribe before writing so the answer cannot slip past
        let mut frames = self.frames.subscribe();
        self.send_raw_command(&request.line, rate_limited).await?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let frame = match timeout_at(deadline, frames.recv()).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    tracing::warn!("Request {} missed {} frames", request.line, n);
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(None),
                Err(_) => {
                    tracing::debug!(
                        "No {} response to {} within {:?}",
                        request.expected_prefix,
                        request.line,
                        self.timeout
                    );
                    return Ok(None);
                }
            };

            match match_frame(&frame, &request.expected_prefix) {
                FrameMatch::Answer => return Ok(Some(frame)),
                FrameMatch::DeviceError => {
                    return match request.policy {
                        ErrorPolicy::Raise => Err(AvrError::Device { code: frame }),
                        ErrorPolicy::Log => {
                            tracing::error!("Receiver rejected {}: {}", request.line, frame);
                            Ok(None)
                        }
                        ErrorPolicy::Ignore => {
                            tracing::debug!("Receiver rejected {}: {}", request.line, frame);
                            Ok(None)
                        }
                    };
                }
                FrameMatch::Unrelated => continue,
            }
        }
    }

    /// Shut down the write side of the socket
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.stream.shutdown().await {
            tracing::debug!("Error closing socket: {}", e);
        }
    }

    fn activity(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.last_activity.lock().unwrap()
    }
}

/// Idle time, probe interval and probe count follow the configured timeout
fn configure_keepalive(stream: &TcpStream, timeout: Duration) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(timeout).with_interval(timeout);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "freebsd"
    ))]
    let keepalive = keepalive.with_retries(KEEPALIVE_PROBES);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
