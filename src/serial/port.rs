//! Serial port backed [`LineTransport`].

use super::LineTransport;
use crate::config::SerialSettings;
use crate::error::{SerialError, SerialResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Thread-safe shared serial port with buffered reading.
///
/// Shared so that a bus carrying several devices can hand the same port to
/// more than one transport.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Create a [`SharedPort`] from a type-erased serial port.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Line transport over a shared serial port.
///
/// Defaults: `"\r\n"` line terminator, `'\n'` response delimiter, 1 s read
/// timeout.
///
/// A read that times out drops any partial line it had already buffered.
#[derive(Clone)]
pub struct SerialLineTransport {
    port: SharedPort,
    label: String,
    line_terminator: String,
    response_delimiter: u8,
    timeout: Duration,
}

impl std::fmt::Debug for SerialLineTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLineTransport")
            .field("label", &self.label)
            .field("line_terminator", &self.line_terminator)
            .field("response_delimiter", &(self.response_delimiter as char))
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SerialLineTransport {
    /// Wrap an already shared port.
    pub fn new(port: SharedPort, label: impl Into<String>) -> Self {
        Self {
            port,
            label: label.into(),
            line_terminator: "\r\n".to_string(),
            response_delimiter: b'\n',
            timeout: super::DEFAULT_READ_TIMEOUT,
        }
    }

    /// Wrap any async byte stream.
    pub fn from_stream(stream: impl SerialPortIO + 'static, label: impl Into<String>) -> Self {
        Self::new(wrap_shared(Box::new(stream)), label)
    }

    /// Apply terminator, delimiter and timeout from [`SerialSettings`].
    ///
    /// Non-ASCII delimiters are rejected by `SequencerConfig::validate`; one
    /// that slips through falls back to `'\n'`.
    pub fn with_settings(mut self, settings: &SerialSettings) -> Self {
        self.line_terminator = settings.line_terminator.clone();
        self.response_delimiter = u8::try_from(settings.response_delimiter).unwrap_or(b'\n');
        self.timeout = settings.read_timeout();
        self
    }

    /// Set the default read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the line terminator appended to every write.
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Set the byte that ends a response line.
    pub fn with_response_delimiter(mut self, delimiter: u8) -> Self {
        self.response_delimiter = delimiter;
        self
    }

    /// Handle to the underlying shared port.
    pub fn port(&self) -> &SharedPort {
        &self.port
    }

    /// Open a serial port (8N1, no flow control) using spawn_blocking.
    #[cfg(feature = "tokio_serial")]
    pub async fn open(settings: &SerialSettings) -> anyhow::Result<Self> {
        use anyhow::Context;
        use tokio::task::spawn_blocking;
        use tokio_serial::SerialPortBuilderExt;

        let path = settings.port.clone();
        let baud_rate = settings.baud_rate;

        let stream = spawn_blocking(move || {
            tokio_serial::new(&path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .with_context(|| format!("Failed to open serial port '{}' at {} baud", path, baud_rate))
        })
        .await
        .context("spawn_blocking for serial port opening failed")??;

        Ok(Self::from_stream(stream, settings.port.clone()).with_settings(settings))
    }

    /// Discard stale input until nothing arrives for `timeout_ms`.
    ///
    /// Returns the number of bytes discarded, including bytes already held in
    /// the read buffer.
    pub async fn drain_input(&self, timeout_ms: u64) -> usize {
        let mut guard = self.port.lock().await;

        let buffered = guard.buffer().len();
        guard.consume(buffered);

        let mut discard = [0u8; 256];
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        let mut total_discarded = buffered;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, guard.get_mut().read(&mut discard)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => total_discarded += n,
                Ok(Err(_)) | Err(_) => break,
            }
        }

        if total_discarded > 0 {
            debug!(port = %self.label, bytes = total_discarded, "Discarded stale serial input");
        }
        total_discarded
    }
}

#[async_trait]
impl LineTransport for SerialLineTransport {
    async fn write_line(&mut self, line: &str) -> SerialResult<()> {
        let mut guard = self.port.lock().await;
        let framed = format!("{}{}", line, self.line_terminator);

        let port = guard.get_mut();
        port.write_all(framed.as_bytes()).await?;
        port.flush().await?;

        debug!(port = %self.label, command = %line, "Sent serial line");
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> SerialResult<String> {
        let mut guard = self.port.lock().await;
        let mut buf = Vec::with_capacity(64);

        let n = match tokio::time::timeout(timeout, guard.read_until(self.response_delimiter, &mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(SerialError::Timeout(timeout)),
        };
        if n == 0 {
            return Err(SerialError::Disconnected);
        }

        let response = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n', self.response_delimiter as char])
            .to_string();
        debug!(port = %self.label, response = %response, "Received serial line");
        Ok(response)
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }

    fn describe(&self) -> String {
        format!("serial port {}", self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_terminated_lines() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut transport = SerialLineTransport::from_stream(device, "duplex");

        transport.write_line("*IDN?").await.unwrap();

        let mut buf = [0u8; 7];
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"*IDN?\r\n");
    }

    #[tokio::test]
    async fn reads_one_line_at_a_time() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut transport = SerialLineTransport::from_stream(device, "duplex");

        host.write_all(b":SOURCE A\r\n:SOURCE B\r\n").await.unwrap();

        let timeout = Duration::from_millis(100);
        assert_eq!(transport.read_line(timeout).await.unwrap(), ":SOURCE A");
        assert_eq!(transport.read_line(timeout).await.unwrap(), ":SOURCE B");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out() {
        let (_host, device) = tokio::io::duplex(64);
        let mut transport = SerialLineTransport::from_stream(device, "duplex");

        let err = transport.read_line(Duration::from_millis(250)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn closed_peer_is_a_disconnect() {
        let (host, device) = tokio::io::duplex(64);
        let mut transport = SerialLineTransport::from_stream(device, "duplex");
        drop(host);

        let err = transport.read_line(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, SerialError::Disconnected));
    }

    #[tokio::test]
    async fn settings_control_framing() {
        let (mut host, device) = tokio::io::duplex(64);
        let settings = SerialSettings {
            line_terminator: "\r".to_string(),
            response_delimiter: '\r',
            read_timeout_ms: 300,
            ..SerialSettings::default()
        };
        let mut transport = SerialLineTransport::from_stream(device, "duplex").with_settings(&settings);
        assert_eq!(transport.default_timeout(), Duration::from_millis(300));

        transport.write_line("D?").await.unwrap();
        let mut buf = [0u8; 3];
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"D?\r");

        host.write_all(b"1.5E-3\r").await.unwrap();
        let line = transport.read_line(Duration::from_millis(100)).await.unwrap();
        assert_eq!(line, "1.5E-3");
    }

    #[tokio::test]
    async fn drain_discards_stale_bytes() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut transport = SerialLineTransport::from_stream(device, "duplex");

        host.write_all(b"stale data 12345").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let discarded = transport.drain_input(50).await;
        assert_eq!(discarded, 16);

        host.write_all(b"fresh\n").await.unwrap();
        let line = transport.read_line(Duration::from_millis(100)).await.unwrap();
        assert_eq!(line, "fresh");
    }
}
