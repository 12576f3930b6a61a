use crate::error::{ConfigError, SerialError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use std::{
    io::{self, Read},
    time::Duration,
};

/// Longest line accepted from the turntable, longer input is discarded.
pub const MAX_LINE_LEN: usize = 1024;

fn default_baud_rate() -> u32 {
    115_200
}

fn default_read_timeout_ms() -> u64 {
    1_000
}

fn default_reconnect_delay_ms() -> u64 {
    2_000
}

/// Serial link configuration. The same settings are used for every
/// (re)connection attempt.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SerialConfig {
    /// Device identifier, e.g. `/dev/ttyACM0` or `COM4`.
    pub port: String,
    /// Line speed of the microcontroller.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per read timeout. Only keeps the read loop responsive, a timeout
    /// is never an error.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Constant delay between failed connection attempts.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl SerialConfig {
    /// Create new serial configuration using defaults.
    ///
    /// * `port`: device identifier of the serial port.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.trim().is_empty() {
            return Err(ConfigError::Invalid("serial.port must not be empty".into()));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("serial.baud_rate must be positive".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "serial.read_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Seam over the primitive that opens the serial device, so the connection
/// lifecycle can be driven without hardware.
pub trait PortOpener {
    /// Byte stream of an open connection.
    type Port: Read + Send;

    /// Make a single attempt to open the port described by `config`.
    fn open(&mut self, config: &SerialConfig) -> Result<Self::Port, SerialError>;
}

/// Opens real serial devices through the `serialport` crate.
pub struct SystemPortOpener;

impl PortOpener for SystemPortOpener {
    type Port = Box<dyn SerialPort>;

    fn open(&mut self, config: &SerialConfig) -> Result<Self::Port, SerialError> {
        serialport::new(&config.port, config.baud_rate)
            .timeout(config.read_timeout())
            .open()
            .map_err(|source| SerialError::Open {
                port: config.port.clone(),
                source,
            })
    }
}

/// Result of a single `read_line` call.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete line with its terminator stripped.
    Line(String),
    /// The read timed out with no complete line, keep waiting.
    Idle,
    /// The connection failed. The channel is closed and must be discarded.
    Dead,
}

/// One open serial connection, framed into text lines. A channel is
/// never reused after it reports `Dead`.
pub struct SerialChannel<P> {
    /// `None` once the connection has failed or been closed.
    port: Option<P>,
    port_name: String,
    baud_rate: u32,
    /// Bytes received after the last terminator.
    pending: Vec<u8>,
    /// Set while skipping the remainder of an overlong line.
    discarding: bool,
    last_error: Option<io::Error>,
}

impl<P: Read> SerialChannel<P> {
    /// Wrap an open port.
    ///
    /// * `port`: the open byte stream.
    /// * `config`: settings the port was opened with.
    pub fn new(port: P, config: &SerialConfig) -> Self {
        Self {
            port: Some(port),
            port_name: config.port.clone(),
            baud_rate: config.baud_rate,
            pending: Vec::new(),
            discarding: false,
            last_error: None,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Liveness signal, false once an I/O error closed the channel.
    pub fn is_alive(&self) -> bool {
        self.port.is_some()
    }

    /// The error that closed the channel, if any.
    pub fn last_error(&self) -> Option<&io::Error> {
        self.last_error.as_ref()
    }

    /// Block until a line is available, the read times out, or the
    /// connection fails. Lines that are not valid UTF-8 are dropped and
    /// reading continues.
    pub fn read_line(&mut self) -> ReadOutcome {
        let mut chunk = [0_u8; 256];
        loop {
            if let Some(line) = self.take_line() {
                return ReadOutcome::Line(line);
            }

            let Some(port) = self.port.as_mut() else {
                return ReadOutcome::Dead;
            };

            match port.read(&mut chunk) {
                Ok(0) => {
                    self.fail(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port closed by peer",
                    ));
                    return ReadOutcome::Dead;
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    if !self.pending.contains(&b'\n') && self.pending.len() > MAX_LINE_LEN {
                        warn!(
                            "Discarding {} bytes without a line terminator on {}",
                            self.pending.len(),
                            self.port_name
                        );
                        self.pending.clear();
                        self.discarding = true;
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                    return ReadOutcome::Idle;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(e);
                    return ReadOutcome::Dead;
                }
            }
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.port_name);
        }
        self.pending.clear();
    }

    /// Pop the next decodable line out of the pending buffer.
    fn take_line(&mut self) -> Option<String> {
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if raw.len() > MAX_LINE_LEN {
                warn!("Dropped overlong line on {}", self.port_name);
                continue;
            }
            match String::from_utf8(raw) {
                Ok(text) => return Some(text.trim_end().to_string()),
                Err(e) => warn!("Dropped undecodable line on {}: {e}", self.port_name),
            }
        }
        None
    }

    fn fail(&mut self, error: io::Error) {
        warn!("Serial connection to {} failed: {error}", self.port_name);
        self.last_error = Some(error);
        self.close();
    }
}

/// Scripted stand-ins for serial hardware.
#[cfg(test)]
pub(crate) mod testing {

    use super::*;
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
    };

    /// One step of a scripted port.
    #[derive(Clone, Debug)]
    pub enum Step {
        Data(Vec<u8>),
        Timeout,
        Fail(io::ErrorKind),
    }

    impl Step {
        pub fn line(text: &str) -> Self {
            Step::Data(format!("{text}\r\n").into_bytes())
        }
    }

    /// Replays steps then idles. Raises `stop_when_drained` once the
    /// script is used up so a read loop under test can finish.
    pub struct ScriptedPort {
        steps: VecDeque<Step>,
        stop_when_drained: Option<Arc<AtomicBool>>,
    }

    impl ScriptedPort {
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                stop_when_drained: None,
            }
        }

        pub fn stopping(mut self, stop_signal: Arc<AtomicBool>) -> Self {
            self.stop_when_drained = Some(stop_signal);
            self
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.steps.pop_front() {
                Some(Step::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.steps.push_front(Step::Data(data.split_off(n)));
                    }
                    Ok(n)
                }
                Some(Step::Timeout) => Err(io::ErrorKind::TimedOut.into()),
                Some(Step::Fail(kind)) => Err(kind.into()),
                None => {
                    if let Some(stop_signal) = &self.stop_when_drained {
                        stop_signal.store(true, Ordering::Relaxed);
                    }
                    Err(io::ErrorKind::TimedOut.into())
                }
            }
        }
    }

    /// Replays open attempts in order: `None` fails, `Some` hands out the
    /// port. Every attempt past the script fails. Shared counters let a test
    /// inspect attempts after the opener moved.
    pub struct ScriptedOpener {
        pub script: VecDeque<Option<ScriptedPort>>,
        pub attempts: Arc<Mutex<Vec<std::time::Instant>>>,
    }

    impl ScriptedOpener {
        /// Fail `failures` times, then hand out `ports` in order.
        pub fn new(ports: Vec<ScriptedPort>, failures: usize) -> Self {
            let mut script: Vec<Option<ScriptedPort>> = (0..failures).map(|_| None).collect();
            script.extend(ports.into_iter().map(Some));
            Self::with_script(script)
        }

        pub fn with_script(script: Vec<Option<ScriptedPort>>) -> Self {
            Self {
                script: script.into(),
                attempts: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl PortOpener for ScriptedOpener {
        type Port = ScriptedPort;

        fn open(&mut self, config: &SerialConfig) -> Result<Self::Port, SerialError> {
            self.attempts
                .lock()
                .expect("Poisoned attempts")
                .push(std::time::Instant::now());
            self.script.pop_front().flatten().ok_or_else(|| SerialError::Open {
                port: config.port.clone(),
                source: serialport::Error::new(
                    serialport::ErrorKind::NoDevice,
                    "device not present",
                ),
            })
        }
    }
}
