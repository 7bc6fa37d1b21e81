// MIT License - Copyright (c) 2026 Peter Wright
// Buffered byte-stream transport for serial lines and RS485-to-Ethernet adapters

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info, trace};

use crate::error::{Result, WallpadError};
use crate::transport::BusTransport;

const READ_CHUNK: usize = 256;

/// Line settings for the serial binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl SerialSettings {
    /// Build settings from the textual form used in config files
    /// (`bytesize` 5-8, parity `N`/`E`/`O`, `stopbits` 1 or 2).
    pub fn new(
        port: impl Into<String>,
        baud_rate: u32,
        bytesize: u8,
        parity: &str,
        stopbits: u8,
    ) -> Result<Self> {
        let data_bits = match bytesize {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(WallpadError::InvalidConfig {
                    details: format!("unsupported bytesize {other}"),
                });
            }
        };
        let parity = match parity.to_ascii_uppercase().as_str() {
            "N" | "NONE" => Parity::None,
            "E" | "EVEN" => Parity::Even,
            "O" | "ODD" => Parity::Odd,
            other => {
                return Err(WallpadError::InvalidConfig {
                    details: format!("unsupported parity {other}"),
                });
            }
        };
        let stop_bits = match stopbits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => {
                return Err(WallpadError::InvalidConfig {
                    details: format!("unsupported stopbits {other}"),
                });
            }
        };
        Ok(Self {
            port: port.into(),
            baud_rate,
            data_bits,
            parity,
            stop_bits,
        })
    }
}

/// A bus transport over any async byte stream.
///
/// Received bytes are pulled into an internal buffer, so `bytes_available`
/// and the pending-echo counter behave identically for every stream type.
pub struct StreamTransport<S> {
    stream: S,
    endpoint: String,
    buf: VecDeque<u8>,
    pending_echo: usize,
    read_timeout: Duration,
}

/// Serial-port binding.
pub type SerialTransport = StreamTransport<SerialStream>;

/// TCP binding for RS485-to-Ethernet adapters.
pub type TcpTransport = StreamTransport<TcpStream>;

impl StreamTransport<SerialStream> {
    /// Open a serial port.
    pub fn open(settings: &SerialSettings, read_timeout: Duration) -> Result<Self> {
        info!(
            "Opening serial port {} ({} baud)",
            settings.port, settings.baud_rate
        );
        let stream = tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .open_native_async()?;
        Ok(Self::new(stream, settings.port.clone(), read_timeout))
    }
}

impl StreamTransport<TcpStream> {
    /// Connect to an RS485-to-Ethernet adapter.
    pub async fn connect(address: &str, port: u16, read_timeout: Duration) -> Result<Self> {
        let endpoint = format!("{address}:{port}");
        info!("Connecting to bus adapter at {endpoint}");
        let stream = TcpStream::connect(&endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, endpoint, read_timeout))
    }
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, endpoint: impl Into<String>, read_timeout: Duration) -> Self {
        Self {
            stream,
            endpoint: endpoint.into(),
            buf: VecDeque::with_capacity(READ_CHUNK),
            pending_echo: 0,
            read_timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Check that something is talking on the bus.
    ///
    /// A dead link ("nothing plugged in") fails with
    /// [`WallpadError::NoTraffic`] instead of looking like a quiet period.
    /// The probed bytes stay buffered.
    pub async fn probe(&mut self, probe_timeout: Duration) -> Result<()> {
        if !self.buf.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + probe_timeout;
        if self.fill_once(deadline).await? {
            debug!("Probe on {} saw traffic", self.endpoint);
            Ok(())
        } else {
            Err(WallpadError::NoTraffic {
                endpoint: self.endpoint.clone(),
            })
        }
    }

    /// Take whatever arrives within `limit` without any framing.
    ///
    /// A quiet line yields [`WallpadError::ReadTimeout`], as with `read`.
    pub async fn read_raw(&mut self, limit: Duration) -> Result<Vec<u8>> {
        if self.buf.is_empty() {
            let deadline = Instant::now() + limit;
            if !self.fill_once(deadline).await? {
                return Err(WallpadError::ReadTimeout);
            }
        }
        self.try_fill().await?;
        Ok(self.buf.drain(..).collect())
    }

    /// Read one chunk before `deadline`. Returns `false` on timeout.
    async fn fill_once(&mut self, deadline: Instant) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        match timeout_at(deadline, self.stream.read(&mut chunk)).await {
            Ok(Ok(0)) => Err(WallpadError::ConnectionLost),
            Ok(Ok(n)) => {
                trace!("rx {:02x?}", &chunk[..n]);
                self.buf.extend(&chunk[..n]);
                Ok(true)
            }
            Ok(Err(e)) => Err(WallpadError::Io(e)),
            Err(_) => Ok(false),
        }
    }

    /// Drain everything that is readable right now into the buffer.
    async fn try_fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match timeout(Duration::ZERO, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(WallpadError::ConnectionLost),
                Ok(Ok(n)) => self.buf.extend(&chunk[..n]),
                Ok(Err(e)) => return Err(WallpadError::Io(e)),
                Err(_) => return Ok(()),
            }
        }
    }
}

impl<S> BusTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.read_timeout;
        while self.buf.len() < n {
            if !self.fill_once(deadline).await? {
                return Err(WallpadError::ReadTimeout);
            }
        }
        self.pending_echo = self.pending_echo.saturating_sub(n);
        Ok(self.buf.drain(..n).collect())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("tx {:02x?}", bytes);
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn mark_pending_from_write(&mut self) -> Result<()> {
        self.try_fill().await?;
        self.pending_echo = self.buf.len();
        Ok(())
    }

    fn pending_count(&self) -> usize {
        self.pending_echo
    }

    async fn bytes_available(&mut self) -> Result<usize> {
        self.try_fill().await?;
        Ok(self.buf.len())
    }

    async fn wait_available(&mut self, n: usize, limit: Duration) -> Result<bool> {
        let deadline = Instant::now() + limit;
        while self.buf.len() < n {
            if !self.fill_once(deadline).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }
}
