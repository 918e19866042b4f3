//! Serial transport for the pulse-count protocol (spec.md §4.5): a small
//! line-oriented request/response exchange over the board's tty. Kept behind
//! a trait so `PulseCountState` can be driven by a deterministic double in
//! tests instead of a real `/dev/ttyACM*`.

use std::io::{self, BufRead, BufReader, Write};
use std::time::Duration;

pub trait SerialPort: Send {
    /// Write one line (the newline is appended by the implementation).
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Write raw bytes with no framing or encoding, for the bitstream upload
    /// itself (spec.md §4.2/§6: 512-byte chunks, no line terminator).
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Block for up to `timeout` for one line of response, trimmed of its
    /// trailing newline. `Ok(None)` on timeout, matching spec.md §4.5's
    /// "no-response" edge case rather than treating it as an I/O error.
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>>;
}

/// Thin wrapper over `serialport::SerialPort`, opened by the caller at a
/// fixed baud (spec.md leaves the rate unspecified for the distilled
/// protocol; 115200 8N1 is the board's documented console rate).
pub struct RealSerialPort {
    inner: BufReader<Box<dyn serialport::SerialPort>>,
}

impl RealSerialPort {
    pub fn open(path: &str, baud_rate: u32) -> serialport::Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(200))
            .open()?;
        Ok(RealSerialPort { inner: BufReader::new(port) })
    }
}

impl SerialPort for RealSerialPort {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let port = self.inner.get_mut();
        port.write_all(line.as_bytes())?;
        port.write_all(b"\r\n")?;
        port.flush()
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = self.inner.get_mut();
        port.write_all(bytes)?;
        port.flush()
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        self.inner.get_mut().set_timeout(timeout).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let mut buf = String::new();
        match self.inner.read_line(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf.trim_end_matches(['\r', '\n']).to_string())),
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Scripted double for tests: a queue of canned responses, and a record of
/// every line written to it so a test can assert on the exact request the
/// protocol driver sent.
pub struct MockSerialPort {
    pub written: Vec<String>,
    pub written_raw: Vec<Vec<u8>>,
    responses: std::collections::VecDeque<Option<String>>,
}

impl MockSerialPort {
    pub fn new(responses: Vec<Option<String>>) -> Self {
        MockSerialPort { written: Vec::new(), written_raw: Vec::new(), responses: responses.into() }
    }
}

impl SerialPort for MockSerialPort {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.written.push(line.to_string());
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.written_raw.push(bytes.to_vec());
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> io::Result<Option<String>> {
        Ok(self.responses.pop_front().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_replays_responses_in_order_and_records_writes() {
        let mut port = MockSerialPort::new(vec![Some("OK".into()), None, Some("42".into())]);
        port.write_line("PING").unwrap();
        assert_eq!(port.read_line(Duration::from_millis(10)).unwrap(), Some("OK".to_string()));
        assert_eq!(port.read_line(Duration::from_millis(10)).unwrap(), None);
        assert_eq!(port.read_line(Duration::from_millis(10)).unwrap(), Some("42".to_string()));
        assert_eq!(port.written, vec!["PING".to_string()]);
    }
}
