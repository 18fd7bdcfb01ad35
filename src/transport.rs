// SPDX-License-Identifier: GPL-3.0-or-later

//! The serial transport: typed little-endian integer I/O, the ack handshake, and the
//! connect/disconnect state machine described in §4.1.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{Error, Result};

/// Marker substring the firmware's version response must contain for `connect` to
/// accept the device. The real marker is firmware-specific; this one is this
/// implementation's own invented protocol, see `SPEC_FULL.md` §9.
const VERSION_MARKER: &str = "BL";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A byte stream usable as the transport's underlying link. Implemented for the boxed
/// `serialport::SerialPort` used by [`connect`], and by an in-memory duplex pipe in
/// tests, so the framing logic never depends on a real serial port being present.
pub trait Port: Read + Write + Send {
    /// Number of bytes currently buffered for reading, without blocking.
    fn bytes_to_read(&mut self) -> std::io::Result<u32>;
}

impl Port for Box<dyn serialport::SerialPort> {
    fn bytes_to_read(&mut self) -> std::io::Result<u32> {
        serialport::SerialPort::bytes_to_read(self.as_mut())
    }
}

/// Connection parameters. No value is read from the environment; every field must be
/// supplied explicitly or left at its documented default.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Serial device path, e.g. `/dev/ttyUSB0`. `None` triggers VID/PID autodetection.
    pub port: Option<String>,
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            port: None,
            baud_rate: 1_000_000,
            timeout: Duration::from_secs(1),
        }
    }
}

/// Carries typed integers and raw byte blocks over a [`Port`]; owns exactly one open
/// link at a time and tracks the Disconnected/Connected state machine of §4.1.
pub struct Transport<P> {
    stream: Option<P>,
    config: TransportConfig,
    firmware_version: Option<String>,
}

impl<P: Port> Transport<P> {
    /// Wrap an already-open stream without performing the version handshake. Used by
    /// tests and by callers that have already validated the device out of band.
    pub fn from_stream(stream: P, config: TransportConfig) -> Self {
        Transport {
            stream: Some(stream),
            config,
            firmware_version: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.firmware_version.as_deref()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn stream_for_test(&mut self) -> &mut P {
        self.stream.as_mut().expect("stream not connected in test harness")
    }

    /// Queries the firmware version string and accepts the device only if it contains
    /// [`VERSION_MARKER`]. On success the transport transitions to Connected.
    pub fn handshake(&mut self) -> Result<()> {
        self.send_u8(benchlink_protocol::Primary::Common.into())?;
        self.send_u8(benchlink_protocol::common::GET_VERSION)?;
        let version = self.read_version_string()?;
        if !version.contains(VERSION_MARKER) {
            self.disconnect();
            return Err(Error::Connection(format!(
                "unexpected firmware version string: {:?}",
                version
            )));
        }
        debug!("connected to firmware version {}", version);
        self.firmware_version = Some(version);
        Ok(())
    }

    fn read_version_string(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        for _ in 0..64 {
            let b = self.get_u8()?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Closes the link. Idempotent; the transport transitions to Disconnected.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!("transport disconnected");
        }
        self.firmware_version = None;
    }

    fn stream_mut(&mut self) -> Result<&mut P> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::Connection("transport is disconnected".into()))
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("TX {:02x?}", bytes);
        self.stream_mut()?.write_all(bytes)?;
        Ok(())
    }

    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let stream = self.stream_mut()?;
        let mut got = 0;
        let deadline = Instant::now() + self.config.timeout;
        while got < n && Instant::now() < deadline {
            match stream.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::Transport(e)),
            }
        }
        if got < n {
            warn!("short read: expected {} bytes, got {}", n, got);
            return Err(Error::ShortRead {
                expected: n,
                got,
            });
        }
        trace!("RX {:02x?}", buf);
        Ok(buf)
    }

    pub fn send_u8(&mut self, value: u8) -> Result<()> {
        self.write(&[value])
    }

    pub fn send_u16(&mut self, value: u16) -> Result<()> {
        self.write(&benchlink_protocol::pack_u16(value))
    }

    pub fn send_u32(&mut self, value: u32) -> Result<()> {
        self.write(&benchlink_protocol::pack_u32(value))
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.read(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(benchlink_protocol::unpack_u16(&self.read(2)?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(benchlink_protocol::unpack_u32(&self.read(4)?))
    }

    /// Reads one ack byte. Bit 0 clear is a protocol-level failure (I6); other bits
    /// carry side-channel status the caller may want to inspect (e.g. I2C ack bits).
    pub fn get_ack(&mut self) -> Result<u8> {
        let byte = self.get_u8()?;
        if byte & benchlink_protocol::ACK_BIT == 0 {
            self.disconnect();
            return Err(Error::MissingAck(byte));
        }
        Ok(byte)
    }

    /// Polls at a 20 ms cadence until at least one byte is available or `timeout`
    /// elapses.
    pub fn wait_for_data(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let available = self
                .stream
                .as_mut()
                .and_then(|s| s.bytes_to_read().ok())
                .unwrap_or(0);
            if available > 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - Instant::now()));
        }
    }
}

/// Opens a real serial link via the `serialport` crate, optionally autodetecting the
/// port by matching §6.2's VID/PID pairs, and performs the version handshake.
pub fn connect(config: TransportConfig) -> Result<Transport<Box<dyn serialport::SerialPort>>> {
    let port_name = match &config.port {
        Some(p) => p.clone(),
        None => autodetect()?,
    };
    check_permissions(&port_name)?;
    let stream = serialport::new(&port_name, config.baud_rate)
        .timeout(config.timeout)
        .open()
        .map_err(|e| Error::Connection(format!("opening {}: {}", port_name, e)))?;
    let mut transport = Transport::from_stream(stream, config);
    transport.handshake()?;
    Ok(transport)
}

fn autodetect() -> Result<String> {
    let ports = serialport::available_ports()
        .map_err(|e| Error::Connection(format!("enumerating ports: {}", e)))?;
    for port in ports {
        if let serialport::SerialPortType::UsbPort(info) = port.port_type {
            if benchlink_protocol::USB_IDS
                .iter()
                .any(|&(vid, pid)| vid == info.vid && pid == info.pid)
            {
                return Ok(port.port_name);
            }
        }
    }
    Err(Error::Connection("no matching USB device found".into()))
}

/// Best-effort Linux permission check: accept the connection if the process belongs to
/// `dialout`/`uucp`, or if a udev rule granting access has been installed in one of the
/// well-known rule directories. Non-Linux targets always pass (the OS enforces device
/// permissions through other means there).
#[cfg(target_os = "linux")]
fn check_permissions(_port: &str) -> Result<()> {
    const RULE_DIRS: [&str; 3] = [
        "/run/udev/rules.d",
        "/etc/udev/rules.d",
        "/lib/udev/rules.d",
    ];
    const GROUPS: [&str; 2] = ["dialout", "uucp"];

    if in_any_group(&GROUPS) {
        return Ok(());
    }

    for dir in RULE_DIRS.iter() {
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .to_lowercase()
                    .contains("benchlink")
                {
                    return Ok(());
                }
            }
        }
    }

    Err(Error::Connection(
        "permission required: join the dialout/uucp group or install a udev rule".into(),
    ))
}

#[cfg(target_os = "linux")]
fn in_any_group(names: &[&str]) -> bool {
    let gids = process_group_ids();
    for name in names {
        if let Some(gid) = group_id_by_name(name) {
            if gids.contains(&gid) {
                return true;
            }
        }
    }
    false
}

#[cfg(target_os = "linux")]
fn process_group_ids() -> Vec<libc::gid_t> {
    unsafe {
        let n = libc::getgroups(0, std::ptr::null_mut());
        if n <= 0 {
            return Vec::new();
        }
        let mut buf = vec![0 as libc::gid_t; n as usize];
        let n = libc::getgroups(n, buf.as_mut_ptr());
        if n < 0 {
            return Vec::new();
        }
        buf.truncate(n as usize);
        buf
    }
}

#[cfg(target_os = "linux")]
fn group_id_by_name(name: &str) -> Option<libc::gid_t> {
    std::fs::read_to_string("/etc/group").ok().and_then(|contents| {
        contents.lines().find_map(|line| {
            let mut fields = line.split(':');
            if fields.next()? == name {
                fields.nth(1)?.parse().ok()
            } else {
                None
            }
        })
    })
}

#[cfg(not(target_os = "linux"))]
fn check_permissions(_port: &str) -> Result<()> {
    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// An in-memory duplex byte pipe standing in for a real serial port in tests: bytes
    /// written are immediately available to be read back, so tests can script a
    /// firmware's responses.
    pub struct Loopback {
        pub to_read: VecDeque<u8>,
        pub written: Vec<u8>,
    }

    impl Loopback {
        pub fn new() -> Self {
            Loopback {
                to_read: VecDeque::new(),
                written: Vec::new(),
            }
        }

        pub fn queue(&mut self, bytes: &[u8]) {
            self.to_read.extend(bytes.iter().copied());
        }
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut n = 0;
            while n < buf.len() {
                match self.to_read.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            Ok(n)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Port for Loopback {
        fn bytes_to_read(&mut self) -> io::Result<u32> {
            Ok(self.to_read.len() as u32)
        }
    }

    fn harness() -> Transport<Loopback> {
        Transport::from_stream(Loopback::new(), TransportConfig::default())
    }

    #[test]
    fn send_and_get_u16_roundtrip() {
        let mut t = harness();
        t.send_u16(0xBEEF).unwrap();
        assert_eq!(&t.stream.as_ref().unwrap().written, &[0xEF, 0xBE]);

        t.stream.as_mut().unwrap().queue(&[0xEF, 0xBE]);
        assert_eq!(t.get_u16().unwrap(), 0xBEEF);
    }

    #[test]
    fn get_ack_accepts_set_bit_zero() {
        let mut t = harness();
        t.stream.as_mut().unwrap().queue(&[0x01]);
        assert_eq!(t.get_ack().unwrap(), 0x01);
    }

    #[test]
    fn get_ack_rejects_clear_bit_zero_and_disconnects() {
        let mut t = harness();
        t.stream.as_mut().unwrap().queue(&[0x00]);
        assert!(matches!(t.get_ack(), Err(Error::MissingAck(0))));
        assert!(!t.is_connected());
    }

    #[test]
    fn short_read_reports_expected_and_got() {
        let mut t = harness();
        t.stream.as_mut().unwrap().queue(&[0x01]);
        match t.get_u16() {
            Err(Error::ShortRead { expected, got }) => {
                assert_eq!(expected, 2);
                assert_eq!(got, 1);
            }
            other => panic!("expected ShortRead, got {:?}", other),
        }
    }

    #[test]
    fn handshake_accepts_matching_marker() {
        let mut t = harness();
        t.stream.as_mut().unwrap().queue(b"BL-1.0\0");
        t.handshake().unwrap();
        assert_eq!(t.firmware_version(), Some("BL-1.0"));
    }

    #[test]
    fn handshake_rejects_unknown_marker() {
        let mut t = harness();
        t.stream.as_mut().unwrap().queue(b"other\0");
        assert!(t.handshake().is_err());
        assert!(!t.is_connected());
    }

    #[test]
    fn wait_for_data_true_when_bytes_queued() {
        let mut t = harness();
        t.stream.as_mut().unwrap().queue(&[0x01]);
        assert!(t.wait_for_data(Duration::from_millis(50)));
    }

    #[test]
    fn wait_for_data_false_on_timeout() {
        let mut t = harness();
        assert!(!t.wait_for_data(Duration::from_millis(30)));
    }
}
