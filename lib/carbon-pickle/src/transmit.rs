use std::{
    fmt,
    io::{self, Write as _},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs as _},
    str::FromStr,
    time::Duration,
};

use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tracing::debug;

/// Default connect and write timeout when sending a frame.
pub const DEFAULT_TRANSMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// An address parsing error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum AddressError {
    /// The address did not have the `host:port` shape.
    #[snafu(display("address '{}' must be in the form 'host:port'", address))]
    MissingPort {
        /// The address that was given.
        address: String,
    },

    /// The host portion of the address was empty.
    #[snafu(display("address '{}' has an empty host", address))]
    EmptyHost {
        /// The address that was given.
        address: String,
    },

    /// The port portion of the address was not a valid port number.
    #[snafu(display("address '{}' has an invalid port: {}", address, source))]
    InvalidPort {
        /// The address that was given.
        address: String,

        /// Source of the error.
        source: std::num::ParseIntError,
    },
}

/// A transmission error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TransmitError {
    /// The receiver's hostname could not be resolved.
    #[snafu(display("failed to resolve Carbon address {}: {}", address, source))]
    Resolve {
        /// Receiver address.
        address: CarbonAddress,

        /// Source of the error.
        source: io::Error,
    },

    /// No connection could be established to any resolved address.
    #[snafu(display("failed to connect to Carbon at {}: {}", address, source))]
    Connect {
        /// Receiver address.
        address: CarbonAddress,

        /// Source of the error.
        source: io::Error,
    },

    /// A socket option could not be applied to the connection.
    #[snafu(display("failed to configure {} for connection to Carbon at {}: {}", setting, address, source))]
    Configure {
        /// Receiver address.
        address: CarbonAddress,

        /// Name of the setting.
        setting: &'static str,

        /// Source of the error.
        source: io::Error,
    },

    /// The frame could not be written in full.
    #[snafu(display("failed to write {} bytes to Carbon at {}: {}", frame_len, address, source))]
    Write {
        /// Receiver address.
        address: CarbonAddress,

        /// Length of the frame being written.
        frame_len: usize,

        /// Source of the error.
        source: io::Error,
    },
}

/// A `host:port` address of a Carbon pickle receiver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CarbonAddress {
    host: String,
    port: u16,
}

impl CarbonAddress {
    /// Creates a new `CarbonAddress` from its parts.
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Returns the host portion of the address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port portion of the address.
    pub fn port(&self) -> u16 {
        self.port
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>, TransmitError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .context(Resolve { address: self.clone() })?
            .collect::<Vec<_>>();

        if addrs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no addresses returned"))
                .context(Resolve { address: self.clone() });
        }

        Ok(addrs)
    }
}

impl FromStr for CarbonAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').context(MissingPort { address: s })?;
        // Bracketed IPv6 literals (`[::1]:2004`) are accepted.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return EmptyHost { address: s }.fail();
        }

        let port = port.parse::<u16>().context(InvalidPort { address: s })?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for CarbonAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Sends frames to a Carbon pickle receiver.
///
/// Every call to [`send`][Self::send] opens a fresh connection, writes the frame, and closes the connection again.
/// Nothing is retried: a failed send loses the frame.
#[derive(Clone, Debug)]
pub struct Transmitter {
    address: CarbonAddress,
    timeout: Duration,
}

impl Transmitter {
    /// Creates a new `Transmitter` for the given receiver, using [`DEFAULT_TRANSMIT_TIMEOUT`].
    pub fn new(address: CarbonAddress) -> Self {
        Self {
            address,
            timeout: DEFAULT_TRANSMIT_TIMEOUT,
        }
    }

    /// Sets the connect and write timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the receiver address.
    pub fn address(&self) -> &CarbonAddress {
        &self.address
    }

    /// Sends a single frame to the receiver.
    ///
    /// On success, `Ok(n)` is returned, where `n` is the number of bytes written.
    ///
    /// # Errors
    ///
    /// If the receiver cannot be resolved or connected to within the timeout, or the frame cannot be written in full
    /// within the timeout, an error is returned. The connection is closed in all cases.
    pub fn send(&self, frame: &[u8]) -> Result<usize, TransmitError> {
        let mut stream = self.connect()?;

        stream.set_write_timeout(Some(self.timeout)).context(Configure {
            address: self.address.clone(),
            setting: "write timeout",
        })?;

        debug!(address = %self.address, frame_len = frame.len(), "Sending frame to Carbon.");
        stream.write_all(frame).context(Write {
            address: self.address.clone(),
            frame_len: frame.len(),
        })?;

        if let Err(e) = stream.shutdown(Shutdown::Write) {
            debug!(address = %self.address, error = %e, "Failed to cleanly shut down connection to Carbon.");
        }

        debug!(address = %self.address, "Done sending frame to Carbon.");
        Ok(frame.len())
    }

    fn connect(&self) -> Result<TcpStream, TransmitError> {
        let mut last_error = None;
        for addr in self.address.resolve()? {
            debug!(address = %self.address, %addr, "Opening connection to Carbon.");
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }

        let error = last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses to connect to"));
        Err(error).context(Connect {
            address: self.address.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Read as _, net::TcpListener, sync::mpsc, thread};

    use super::*;

    #[test]
    fn parse_address() {
        let address = "carbon1.example.com:2004".parse::<CarbonAddress>().expect("should parse");
        assert_eq!(address.host(), "carbon1.example.com");
        assert_eq!(address.port(), 2004);
        assert_eq!(address.to_string(), "carbon1.example.com:2004");

        let address = "[::1]:2004".parse::<CarbonAddress>().expect("should parse");
        assert_eq!(address.host(), "::1");
        assert_eq!(address.to_string(), "[::1]:2004");
    }

    #[test]
    fn parse_address_errors() {
        assert!(matches!(
            "carbon1".parse::<CarbonAddress>(),
            Err(AddressError::MissingPort { .. })
        ));
        assert!(matches!(":2004".parse::<CarbonAddress>(), Err(AddressError::EmptyHost { .. })));
        assert!(matches!(
            "carbon1:http".parse::<CarbonAddress>(),
            Err(AddressError::InvalidPort { .. })
        ));
        assert!(matches!(
            "carbon1:70000".parse::<CarbonAddress>(),
            Err(AddressError::InvalidPort { .. })
        ));
    }

    #[test]
    fn send_writes_whole_frame_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("should bind listener");
        let port = listener.local_addr().unwrap().port();

        let receiver = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("should accept connection");
            let mut received = Vec::new();
            // Reading to EOF only completes once the sender closes its side.
            stream.read_to_end(&mut received).expect("should read frame");
            received
        });

        let frame = b"\x00\x00\x00\x05hello".to_vec();
        let transmitter = Transmitter::new(CarbonAddress::new("127.0.0.1", port));
        let sent = transmitter.send(&frame).expect("should send frame");
        assert_eq!(sent, frame.len());

        assert_eq!(receiver.join().unwrap(), frame);
    }

    #[test]
    fn stalled_receiver_times_out_write_and_releases_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("should bind listener");
        let port = listener.local_addr().unwrap().port();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let receiver = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("should accept connection");
            // Stop reading until the sender gives up, so its write blocks on full buffers.
            release_rx.recv().expect("should be released");

            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .expect("should set read timeout");
            let mut received = Vec::new();
            // Reaching EOF means the sender closed its end of the connection.
            stream.read_to_end(&mut received).map(|_| received.len())
        });

        let frame = vec![0u8; 64 * 1024 * 1024];
        let transmitter =
            Transmitter::new(CarbonAddress::new("127.0.0.1", port)).with_timeout(Duration::from_millis(250));
        let result = transmitter.send(&frame);
        assert!(matches!(result, Err(TransmitError::Write { frame_len, .. }) if frame_len == frame.len()));

        release_tx.send(()).unwrap();
        let received = receiver.join().unwrap().expect("connection should be closed by the sender");
        assert!(received < frame.len());
    }

    #[test]
    fn send_to_closed_port_fails() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("should bind listener");
            listener.local_addr().unwrap().port()
        };

        let transmitter =
            Transmitter::new(CarbonAddress::new("127.0.0.1", port)).with_timeout(Duration::from_secs(1));
        let result = transmitter.send(b"\x00\x00\x00\x00");
        assert!(matches!(result, Err(TransmitError::Connect { .. })));
    }
}
