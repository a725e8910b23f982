//! Serial transport for the microcontroller link
//!
//! The `serialport` crate is blocking, so the port is driven by two
//! dedicated OS threads and bridged into tokio through channels:
//!
//! ```text
//!            ┌─────────────┐  io::Result<Bytes>  ┌─────────────────┐
//!  UART ───> │  rx thread  │ ──────────────────> │                 │
//!            │ (poll read) │   tokio mpsc        │ SerialTransport │ <──> Connection
//!  UART <─── │  tx thread  │ <────────────────── │ (AsyncRead/     │
//!            │ (write_all) │   std mpsc          │  AsyncWrite)    │
//!            └─────────────┘                     └─────────────────┘
//! ```
//!
//! The rx thread polls the port with a short timeout and checks the closed
//! flag between polls, so dropping or shutting down the transport stops it
//! within one poll interval. Read errors are forwarded to the connection
//! as I/O errors.

use bytes::Bytes;
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortInfo, StopBits};
use std::fmt;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long a single blocking read waits before the rx thread re-checks
/// the closed flag.
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Chunks buffered between the rx thread and the connection task.
const RX_QUEUE_DEPTH: usize = 64;

const READ_CHUNK: usize = 256;

/// Baud rates supported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaudRate {
    B9600,
    B14400,
    B19200,
    B38400,
    B57600,
    B115200,
    B128000,
    B256000,
}

impl BaudRate {
    pub const ALL: [BaudRate; 8] = [
        BaudRate::B9600,
        BaudRate::B14400,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
        BaudRate::B128000,
        BaudRate::B256000,
    ];

    pub fn as_u32(self) -> u32 {
        match self {
            BaudRate::B9600 => 9600,
            BaudRate::B14400 => 14400,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
            BaudRate::B128000 => 128000,
            BaudRate::B256000 => 256000,
        }
    }
}

impl Default for BaudRate {
    fn default() -> Self {
        BaudRate::B115200
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        BaudRate::ALL
            .into_iter()
            .find(|rate| rate.as_u32() == value)
            .ok_or(value)
    }
}

impl FromStr for BaudRate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u32 = s
            .parse()
            .map_err(|_| format!("invalid baud rate: {}", s))?;
        BaudRate::try_from(value).map_err(|v| format!("unsupported baud rate: {}", v))
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Serial port exposed as an async byte stream.
pub struct SerialTransport {
    path: String,
    incoming: mpsc::Receiver<io::Result<Bytes>>,
    pending: Bytes,
    outgoing: Option<std_mpsc::Sender<Bytes>>,
    closed: Arc<AtomicBool>,
}

impl SerialTransport {
    /// Opens a serial port and starts its I/O threads.
    ///
    /// The line is configured 8N1 with DTR and RTS asserted; most boards
    /// wait for DTR before they start talking.
    pub fn open(path: &str, baud_rate: BaudRate) -> Result<Self, serialport::Error> {
        let mut port = serialport::new(path, baud_rate.as_u32())
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(POLL_TIMEOUT)
            .open()?;

        port.write_data_terminal_ready(true)?;
        port.write_request_to_send(true)?;

        let writer = port.try_clone()?;

        info!(port = path, baud = %baud_rate, "Opened serial port");

        let (rx_tx, rx_rx) = mpsc::channel(RX_QUEUE_DEPTH);
        let (tx_tx, tx_rx) = std_mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));

        let rx_closed = Arc::clone(&closed);
        thread::Builder::new()
            .name(format!("serial-rx {}", path))
            .spawn(move || rx_loop(port, rx_tx, rx_closed))?;

        thread::Builder::new()
            .name(format!("serial-tx {}", path))
            .spawn(move || tx_loop(writer, tx_rx))?;

        Ok(Self::from_channels(path, rx_rx, tx_tx, closed))
    }

    /// Lists the serial ports present on this machine.
    pub fn available_ports() -> Result<Vec<SerialPortInfo>, serialport::Error> {
        let ports = serialport::available_ports()?;
        debug!(count = ports.len(), "Enumerated serial ports");
        Ok(ports)
    }

    fn from_channels(
        path: &str,
        incoming: mpsc::Receiver<io::Result<Bytes>>,
        outgoing: std_mpsc::Sender<Bytes>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            path: path.to_string(),
            incoming,
            pending: Bytes::new(),
            outgoing: Some(outgoing),
            closed,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.path)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl AsyncRead for SerialTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            match self.incoming.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.pending = chunk,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                // rx thread gone: end of stream
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = self.pending.len().min(buf.remaining());
        let chunk = self.pending.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for SerialTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = match &self.outgoing {
            Some(tx) => tx
                .send(Bytes::copy_from_slice(buf))
                .map(|_| buf.len())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "serial writer stopped")),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "serial transport shut down",
            )),
        };
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.outgoing = None;
        self.closed.store(true, Ordering::Relaxed);
        Poll::Ready(Ok(()))
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

fn rx_loop(
    mut port: Box<dyn SerialPort>,
    tx: mpsc::Sender<io::Result<Bytes>>,
    closed: Arc<AtomicBool>,
) {
    let mut buf = [0u8; READ_CHUNK];

    while !closed.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!(error = %e, "Serial read failed");
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    }

    debug!("Serial rx thread exiting");
}

fn tx_loop(mut port: Box<dyn SerialPort>, rx: std_mpsc::Receiver<Bytes>) {
    for data in rx {
        if let Err(e) = port.write_all(&data).and_then(|_| port.flush()) {
            warn!(error = %e, "Serial write failed");
            break;
        }
    }

    debug!("Serial tx thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_baud_rate_parsing() {
        assert_eq!("115200".parse::<BaudRate>(), Ok(BaudRate::B115200));
        assert_eq!(BaudRate::try_from(9600), Ok(BaudRate::B9600));
        assert_eq!(BaudRate::try_from(1234), Err(1234));
        assert!("fast".parse::<BaudRate>().is_err());
        assert_eq!(BaudRate::B256000.to_string(), "256000");
        assert_eq!(BaudRate::default().as_u32(), 115200);
    }

    fn bridged() -> (
        SerialTransport,
        mpsc::Sender<io::Result<Bytes>>,
        std_mpsc::Receiver<Bytes>,
        Arc<AtomicBool>,
    ) {
        let (rx_tx, rx_rx) = mpsc::channel(4);
        let (tx_tx, tx_rx) = std_mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));
        let transport =
            SerialTransport::from_channels("/dev/null", rx_rx, tx_tx, Arc::clone(&closed));
        (transport, rx_tx, tx_rx, closed)
    }

    #[test]
    fn test_available_ports_have_names() {
        // Machines without serial hardware (or without enumeration
        // support) legitimately return an error or an empty list
        if let Ok(ports) = SerialTransport::available_ports() {
            assert!(ports.iter().all(|p| !p.port_name.is_empty()));
        }
    }

    #[tokio::test]
    async fn test_reads_chunks_in_order() {
        let (mut transport, device, _written, _) = bridged();

        device.send(Ok(Bytes::from_static(b"abc"))).await.unwrap();
        device.send(Ok(Bytes::from_static(b"def"))).await.unwrap();

        let mut small = [0u8; 2];
        let n = transport.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"ab");

        let mut rest = [0u8; 16];
        let n = transport.read(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], b"c");
        let n = transport.read(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], b"def");

        drop(device);
        assert_eq!(transport.read(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_error_is_forwarded() {
        let (mut transport, device, _written, _) = bridged();

        device
            .send(Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")))
            .await
            .unwrap();

        let mut buf = [0u8; 8];
        let err = transport.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_writes_reach_tx_thread_until_shutdown() {
        let (mut transport, _device, written, closed) = bridged();

        transport.write_all(b"\x78\x78").await.unwrap();
        assert_eq!(written.try_recv().unwrap(), Bytes::from_static(b"\x78\x78"));

        transport.shutdown().await.unwrap();
        assert!(closed.load(Ordering::Relaxed));
        assert!(transport.write_all(b"x").await.is_err());
    }
}
