use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serialport::SerialPort;

use super::{Result, SerialError};

/// Byte transport underneath a [`super::SerialInterface`].
///
/// `read_data` returns `Ok(0)` when nothing arrived before `timeout`; only a
/// broken link is an error.
#[async_trait]
pub trait SerialPortIO: Send {
    async fn send_data(&mut self, data: &[u8]) -> Result<()>;
    async fn read_data(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
    async fn flush(&mut self) -> Result<()>;
    /// Number of bytes waiting in the input buffer. Fails once the device is gone.
    fn bytes_to_read(&self) -> Result<u32>;
}

/// OS serial port opened through `serialport`.
pub struct NativePort {
    port: Box<dyn SerialPort>,
}

impl NativePort {
    pub fn open(port_name: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(|e| SerialError::ConnectionFailed(e.to_string()))?;
        Ok(Self { port })
    }
}

#[async_trait]
impl SerialPortIO for NativePort {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        read_with_deadline(&mut self.port, buf, timeout, |port, remaining| {
            port.set_timeout(remaining)?;
            Ok(())
        })
    }

    async fn flush(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }

    fn bytes_to_read(&self) -> Result<u32> {
        Ok(self.port.bytes_to_read()?)
    }
}

/// Fill `buf` from `reader` until it is full, a read times out, or `timeout`
/// has elapsed overall. Before each read, `set_timeout` shrinks the reader's
/// own timeout to what is left of the overall bound.
fn read_with_deadline<R, F>(reader: &mut R, buf: &mut [u8], timeout: Duration, mut set_timeout: F) -> Result<usize>
where
    R: Read,
    F: FnMut(&mut R, Duration) -> Result<()>,
{
    let deadline = Instant::now() + timeout;
    let mut total = 0;

    while total < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        set_timeout(reader, remaining)?;
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == ErrorKind::TimedOut => break,
            Err(e) => return Err(SerialError::IoError(e)),
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Trickles one byte per `delay`, honouring the timeout it was given.
    struct SlowReader {
        delay: Duration,
        timeout: Duration,
        timeouts_seen: Vec<Duration>,
    }

    impl Read for SlowReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.timeout < self.delay {
                std::thread::sleep(self.timeout);
                return Err(std::io::Error::new(ErrorKind::TimedOut, "timed out"));
            }
            std::thread::sleep(self.delay);
            buf[0] = 0xAA;
            Ok(1)
        }
    }

    #[test]
    fn test_read_stays_within_overall_timeout() {
        let mut reader = SlowReader {
            delay: Duration::from_millis(40),
            timeout: Duration::from_secs(10),
            timeouts_seen: Vec::new(),
        };
        let mut buf = [0u8; 10];
        let started = Instant::now();

        let n = read_with_deadline(&mut reader, &mut buf, Duration::from_millis(100), |r, remaining| {
            r.timeout = remaining;
            r.timeouts_seen.push(remaining);
            Ok(())
        })
        .unwrap();

        let elapsed = started.elapsed();
        assert!((1..=2).contains(&n), "read {} bytes", n);
        assert!(buf[..n].iter().all(|&b| b == 0xAA));
        assert!(elapsed < Duration::from_millis(180), "took {:?}", elapsed);
        assert!(reader.timeouts_seen.iter().all(|t| *t <= Duration::from_millis(100)));
        assert!(reader.timeouts_seen.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_read_stops_when_buffer_full() {
        let mut reader = SlowReader {
            delay: Duration::ZERO,
            timeout: Duration::from_secs(1),
            timeouts_seen: Vec::new(),
        };
        let mut buf = [0u8; 3];
        let n = read_with_deadline(&mut reader, &mut buf, Duration::from_secs(1), |_, _| Ok(())).unwrap();
        assert_eq!(n, 3);
    }
}
