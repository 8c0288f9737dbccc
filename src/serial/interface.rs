use std::time::Duration;
use serialport::{SerialPortInfo, SerialPortType};

use super::io::{NativePort, SerialPortIO};
use super::{PortCandidate, Result, SerialDeviceInfo, SerialError};

// Arpmini device identifiers (ATmega32U4-based, Arduino VID)
pub const ARPMINI_VID: u16 = 0x2341;
pub const ARPMINI_PID: u16 = 0x9030;
pub const BAUD_RATE: u32 = 115200;
pub const READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// USB identity a port must carry to be offered as a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vid: u16,
    pub pid: u16,
    pub label_suffix: String,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            vid: ARPMINI_VID,
            pid: ARPMINI_PID,
            label_suffix: "Arpmini".to_string(),
        }
    }
}

impl DeviceFilter {
    pub fn matches(&self, info: &SerialDeviceInfo) -> bool {
        info.vid == self.vid && info.pid == self.pid
    }

    pub fn label_for(&self, info: &SerialDeviceInfo) -> String {
        format!("{} - {}", info.port_name, self.label_suffix)
    }

    /// Keep only ports matching this filter, in enumeration order.
    pub fn candidates<'a, I>(&self, ports: I) -> Vec<PortCandidate>
    where
        I: IntoIterator<Item = &'a SerialDeviceInfo>,
    {
        ports
            .into_iter()
            .filter(|info| self.matches(info))
            .map(|info| PortCandidate {
                label: self.label_for(info),
                port_name: info.port_name.clone(),
            })
            .collect()
    }
}

/// One open serial link. Owns the port exclusively; callers needing shared
/// access wrap the interface in a mutex.
pub struct SerialInterface {
    port: Option<Box<dyn SerialPortIO>>,
    port_name: Option<String>,
    read_timeout: Duration,
}

impl SerialInterface {
    pub fn new() -> Self {
        Self {
            port: None,
            port_name: None,
            read_timeout: READ_TIMEOUT,
        }
    }

    /// Wrap an already open transport.
    pub fn from_io(port_name: &str, io: Box<dyn SerialPortIO>) -> Self {
        let mut interface = Self::new();
        interface.attach(port_name, io);
        interface
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Enumerate every USB serial port on the system.
    pub fn enumerate_usb_ports() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports.iter().filter_map(usb_device_info).collect())
    }

    /// Labelled candidates for a port picker. An enumeration failure is
    /// reported as "no device".
    pub fn list_candidates(filter: &DeviceFilter) -> Vec<PortCandidate> {
        match Self::enumerate_usb_ports() {
            Ok(ports) => filter.candidates(&ports),
            Err(e) => {
                log::warn!("Serial port enumeration failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Open `port_name` at `baud_rate`.
    pub fn connect(&mut self, port_name: &str, baud_rate: u32) -> Result<()> {
        if self.is_connected() {
            return Err(SerialError::ConnectionFailed(format!(
                "already connected to {}",
                self.port_name.as_deref().unwrap_or("?")
            )));
        }
        let port = NativePort::open(port_name, baud_rate, self.read_timeout)?;
        self.attach(port_name, Box::new(port));
        log::info!("Connected to Arpmini on {} at {} baud", port_name, baud_rate);
        Ok(())
    }

    pub fn attach(&mut self, port_name: &str, io: Box<dyn SerialPortIO>) {
        self.port = Some(io);
        self.port_name = Some(port_name.to_string());
    }

    /// Release the port. Calling this on a closed interface does nothing.
    pub fn disconnect(&mut self) {
        if let Some(name) = self.port_name.take() {
            log::info!("Disconnecting from {}", name);
        }
        self.port = None;
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    /// Peek at the input buffer without consuming it. `false` means the
    /// device is gone or the interface is closed.
    pub fn probe_alive(&self) -> bool {
        match self.port.as_ref() {
            Some(port) => match port.bytes_to_read() {
                Ok(_) => true,
                Err(e) => {
                    log::debug!("Liveness probe failed: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    pub async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(SerialError::NotConnected)?;
        port.send_data(data).await?;
        port.flush().await
    }

    /// Read up to `n` bytes. A short or empty result means the read timed out.
    pub async fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let timeout = self.read_timeout;
        let port = self.port.as_mut().ok_or(SerialError::NotConnected)?;
        let mut buffer = vec![0u8; n];
        let bytes_read = port.read_data(&mut buffer, timeout).await?;
        buffer.truncate(bytes_read);
        Ok(buffer)
    }
}

impl Default for SerialInterface {
    fn default() -> Self {
        Self::new()
    }
}

fn usb_device_info(port: &SerialPortInfo) -> Option<SerialDeviceInfo> {
    if let SerialPortType::UsbPort(ref usb_info) = port.port_type {
        Some(SerialDeviceInfo {
            port_name: port.port_name.clone(),
            vid: usb_info.vid,
            pid: usb_info.pid,
            serial_number: usb_info.serial_number.clone(),
            manufacturer: usb_info.manufacturer.clone(),
            product: usb_info.product.clone(),
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(port_name: &str, vid: u16, pid: u16) -> SerialDeviceInfo {
        SerialDeviceInfo {
            port_name: port_name.to_string(),
            vid,
            pid,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }

    #[test]
    fn test_candidates_keep_only_matching_ids() {
        let ports = vec![
            usb("/dev/ttyACM0", 0x2341, 0x9030),
            usb("/dev/ttyACM1", 0x2341, 0x8036),
            usb("/dev/ttyUSB0", 0x0403, 0x6001),
            usb("/dev/ttyACM2", 0x2341, 0x9030),
        ];
        let candidates = DeviceFilter::default().candidates(&ports);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].port_name, "/dev/ttyACM0");
        assert_eq!(candidates[0].label, "/dev/ttyACM0 - Arpmini");
        assert_eq!(candidates[1].port_name, "/dev/ttyACM2");
    }

    #[test]
    fn test_candidates_empty_when_nothing_matches() {
        let ports = vec![usb("COM3", 0x1234, 0x5678)];
        assert!(DeviceFilter::default().candidates(&ports).is_empty());
    }

    #[test]
    fn test_filter_override() {
        let filter = DeviceFilter { vid: 0x1209, pid: 0x0001, label_suffix: "Clone".to_string() };
        let ports = vec![usb("COM7", 0x1209, 0x0001), usb("COM8", 0x2341, 0x9030)];
        let candidates = filter.candidates(&ports);
        assert_eq!(candidates, vec![PortCandidate { label: "COM7 - Clone".to_string(), port_name: "COM7".to_string() }]);
    }

    #[tokio::test]
    async fn test_closed_interface() {
        let mut interface = SerialInterface::new();
        assert!(!interface.probe_alive());
        assert!(matches!(interface.write_bytes(&[0xFC]).await, Err(SerialError::NotConnected)));
        assert!(matches!(interface.read_bytes(1).await, Err(SerialError::NotConnected)));
        interface.disconnect();
        interface.disconnect();
        assert!(!interface.is_connected());
    }
}
