use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::debug;

use crate::config::{DutConnection, TransportAddr};

pub const FLUSH_LIMIT: usize = 16 * 1024;

/// Byte-stream link to one DUT.
pub trait Transport: Send {
    /// Read whatever is available within the transport's short read timeout.
    /// `Ok(0)` means nothing arrived.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Discard anything already buffered on the input side. Gives up after
    /// [`FLUSH_LIMIT`] bytes so a peer that never pauses cannot stall the caller.
    fn flush_input(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 512];
        let mut drained = 0;
        while drained < FLUSH_LIMIT {
            match self.read_available(&mut scratch)? {
                0 => break,
                n => drained += n,
            }
        }
        Ok(())
    }

    /// Consumes the transport, so it can only ever be closed once.
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Opens transports for DUTs. Monitors reopen through this after every power cycle.
pub trait Connector: Send + Sync {
    fn open(&self, dut: &DutConnection) -> Result<Box<dyn Transport>>;
}

pub fn open_port(path: &str, baud: u32, rtscts: bool, timeout: Duration) -> Result<Box<dyn SerialPort>> {
    let builder = serialport::new(path, baud)
        .timeout(timeout)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(if rtscts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        });

    builder
        .open()
        .map_err(|e| anyhow!("open {}: {}", path, e))
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud: u32, rtscts: bool, read_timeout: Duration) -> Result<Self> {
        let port = open_port(path, baud, rtscts, read_timeout)?;
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn flush_input(&mut self) -> io::Result<()> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        // the fd is released when the port drops
        Ok(())
    }
}

pub struct TcpTransport {
    stream: TcpStream,
    read_timeout: Duration,
}

impl TcpTransport {
    pub fn connect(addr: &str, read_timeout: Duration) -> Result<Self> {
        let sock = addr
            .to_socket_addrs()
            .with_context(|| format!("resolving {}", addr))?
            .next()
            .ok_or_else(|| anyhow!("{} resolves to no address", addr))?;
        let stream = TcpStream::connect_timeout(&sock, Duration::from_secs(5))
            .with_context(|| format!("connecting to {}", addr))?;
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            read_timeout,
        })
    }
}

impl Transport for TcpTransport {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Drains for at most one read timeout; a streaming peer keeps the rest.
    fn flush_input(&mut self) -> io::Result<()> {
        let deadline = Instant::now() + self.read_timeout;
        let mut scratch = [0u8; 512];
        let mut drained = 0;
        while drained < FLUSH_LIMIT && Instant::now() < deadline {
            match self.read_available(&mut scratch)? {
                0 => break,
                n => drained += n,
            }
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }
}

/// Opens the real serial port or socket named in the DUT's configuration.
pub struct SystemConnector;

impl Connector for SystemConnector {
    fn open(&self, dut: &DutConnection) -> Result<Box<dyn Transport>> {
        debug!(dut = %dut.name, transport = %dut.transport, "opening transport");
        let transport: Box<dyn Transport> = match &dut.transport {
            TransportAddr::Serial { path, baudrate } => {
                Box::new(SerialTransport::open(path, *baudrate, false, dut.read_timeout)?)
            }
            TransportAddr::Tcp { addr } => Box::new(TcpTransport::connect(addr, dut.read_timeout)?),
        };
        Ok(transport)
    }
}
