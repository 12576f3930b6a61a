use crate::devices::hardware::serial::{PortOpener, ReadOutcome, SerialChannel, SerialConfig};
use log::{info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

/// Longest uninterrupted sleep while backing off, so a stop request is
/// noticed quickly.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Delay policy between failed connection attempts. Constant: losing the
/// device is expected to be short lived (power cycle, cable reseat).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Self { delay }
    }

    /// Delay before the next attempt.
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// Counters over the life of a connection manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Successful opens.
    pub connections: u64,
    /// Opens that failed and were retried.
    pub failed_attempts: u64,
    /// Open connections that died mid stream.
    pub losses: u64,
}

/// Link state, driven by open results and read outcomes.
enum LinkState<P> {
    Disconnected,
    Connected(SerialChannel<P>),
}

/// Owns the serial link for the whole process. Opens it with infinite
/// retry, hands out lines, and reopens it whenever a read reports the
/// connection dead. Only a stop request ends the retrying.
pub struct ConnectionManager<O: PortOpener> {
    opener: O,
    config: SerialConfig,
    backoff: Backoff,
    stop_signal: Arc<AtomicBool>,
    state: LinkState<O::Port>,
    stats: ConnectionStats,
}

impl<O: PortOpener> ConnectionManager<O> {
    /// Create a connection manager. Nothing is opened until the first
    /// `acquire` or `next_line`.
    ///
    /// * `opener`: primitive used for every open attempt.
    /// * `config`: fixed port settings for every attempt.
    /// * `stop_signal`: raised to abandon retries and reads.
    pub fn new(opener: O, config: SerialConfig, stop_signal: Arc<AtomicBool>) -> Self {
        Self {
            opener,
            backoff: Backoff::constant(config.reconnect_delay()),
            config,
            stop_signal,
            state: LinkState::Disconnected,
            stats: ConnectionStats::default(),
        }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, LinkState::Connected(_))
    }

    fn is_stopped(&self) -> bool {
        self.stop_signal.load(Ordering::Relaxed)
    }

    /// Block until a connection is open, retrying forever with the backoff
    /// delay between attempts. Returns `None` only when a stop was requested.
    pub fn acquire(&mut self) -> Option<SerialChannel<O::Port>> {
        while !self.is_stopped() {
            match self.opener.open(&self.config) {
                Ok(port) => {
                    self.stats.connections += 1;
                    let channel = SerialChannel::new(port, &self.config);
                    info!("Connected to {} at {} baud", channel.port_name(), channel.baud_rate());
                    return Some(channel);
                }
                Err(e) => {
                    self.stats.failed_attempts += 1;
                    let delay = self.backoff.delay();
                    warn!(
                        "Failed to connect to {}: {e}. Retrying in {:.1} seconds...",
                        self.config.port,
                        delay.as_secs_f64()
                    );
                    if !self.pause(delay) {
                        return None;
                    }
                }
            }
        }
        None
    }

    /// Next line from the link, reconnecting as often as needed. Returns
    /// `None` once a stop was requested. A line is returned exactly once;
    /// the partial line of a dead connection is discarded with it.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            if self.is_stopped() {
                return None;
            }
            if matches!(self.state, LinkState::Disconnected) {
                let channel = self.acquire()?;
                self.state = LinkState::Connected(channel);
            }

            let outcome = match &mut self.state {
                LinkState::Connected(channel) => channel.read_line(),
                LinkState::Disconnected => continue,
            };
            match outcome {
                ReadOutcome::Line(line) => return Some(line),
                ReadOutcome::Idle => {}
                ReadOutcome::Dead => self.connection_lost(),
            }
        }
    }

    /// Close the current connection, if any.
    pub fn close(&mut self) {
        if let LinkState::Connected(mut channel) =
            std::mem::replace(&mut self.state, LinkState::Disconnected)
        {
            channel.close();
            info!("Disconnected from {}", self.config.port);
        }
    }

    fn connection_lost(&mut self) {
        if let LinkState::Connected(channel) =
            std::mem::replace(&mut self.state, LinkState::Disconnected)
        {
            self.stats.losses += 1;
            match channel.last_error() {
                Some(e) => warn!("Serial connection lost: {e}"),
                None => warn!("Serial connection lost"),
            }
        }
    }

    /// Sleep for `delay` unless stopped first. Returns false on stop.
    fn pause(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
        }
    }
}

impl<O: PortOpener> Drop for ConnectionManager<O> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::devices::hardware::serial::testing::{ScriptedOpener, ScriptedPort, Step};
    use std::io;

    fn config(delay_ms: u64) -> SerialConfig {
        let mut config = SerialConfig::new("/dev/ttyTEST");
        config.reconnect_delay_ms = delay_ms;
        config
    }

    #[test]
    fn test_open_fails_twice_then_succeeds() {
        let opener = ScriptedOpener::new(vec![ScriptedPort::new(Vec::new())], 2);
        let attempts = opener.attempts.clone();
        let mut manager = ConnectionManager::new(opener, config(30), Arc::new(AtomicBool::new(false)));

        let channel = manager.acquire().expect("Failed to acquire");
        assert!(channel.is_alive());
        assert_eq!(channel.port_name(), "/dev/ttyTEST");
        assert_eq!(channel.baud_rate(), 115_200);
        assert_eq!(
            manager.stats(),
            ConnectionStats {
                connections: 1,
                failed_attempts: 2,
                losses: 0
            }
        );

        let attempts = attempts.lock().expect("Poisoned attempts");
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(30));
        }
    }

    #[test]
    fn test_stop_abandons_retry() {
        let opener = ScriptedOpener::new(Vec::new(), 0);
        let stop_signal = Arc::new(AtomicBool::new(false));
        let mut manager = ConnectionManager::new(opener, config(10_000), stop_signal.clone());

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop_signal.store(true, Ordering::Relaxed);
        });
        let started = Instant::now();
        assert!(manager.acquire().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        stopper.join().expect("Failed to join stopper");
    }

    #[test]
    fn test_no_attempt_after_stop() {
        let opener = ScriptedOpener::new(Vec::new(), 0);
        let attempts = opener.attempts.clone();
        let mut manager = ConnectionManager::new(opener, config(10), Arc::new(AtomicBool::new(true)));

        assert!(manager.next_line().is_none());
        assert!(attempts.lock().expect("Poisoned attempts").is_empty());
    }

    #[test]
    fn test_reconnect_after_loss_without_replaying_lines() {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let first = ScriptedPort::new(vec![
            Step::line("Angle: 45"),
            Step::Data(b"Angle: 4".to_vec()),
            Step::Fail(io::ErrorKind::BrokenPipe),
        ]);
        let second =
            ScriptedPort::new(vec![Step::Timeout, Step::line("Angle: 5")]).stopping(stop_signal.clone());
        let opener = ScriptedOpener::new(vec![first, second], 0);
        let attempts = opener.attempts.clone();
        let mut manager = ConnectionManager::new(opener, config(10), stop_signal);

        let mut lines = Vec::new();
        while let Some(line) = manager.next_line() {
            lines.push(line);
        }

        assert_eq!(lines, vec!["Angle: 45", "Angle: 5"]);
        assert_eq!(attempts.lock().expect("Poisoned attempts").len(), 2);
        assert_eq!(
            manager.stats(),
            ConnectionStats {
                connections: 2,
                failed_attempts: 0,
                losses: 1
            }
        );
    }

    #[test]
    fn test_reconnect_retries_until_device_returns() {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let first = ScriptedPort::new(vec![Step::Fail(io::ErrorKind::NotConnected)]);
        let second = ScriptedPort::new(vec![Step::line("Angle: 45")]).stopping(stop_signal.clone());
        let opener = ScriptedOpener::with_script(vec![Some(first), None, None, Some(second)]);
        let attempts = opener.attempts.clone();
        let mut manager = ConnectionManager::new(opener, config(5), stop_signal);

        assert_eq!(manager.next_line().as_deref(), Some("Angle: 45"));
        assert!(manager.is_connected());
        assert_eq!(
            manager.stats(),
            ConnectionStats {
                connections: 2,
                failed_attempts: 2,
                losses: 1
            }
        );
        assert_eq!(attempts.lock().expect("Poisoned attempts").len(), 4);
    }

    #[test]
    fn test_backoff_follows_config() {
        let manager = ConnectionManager::new(
            ScriptedOpener::new(Vec::new(), 0),
            SerialConfig::new("/dev/ttyTEST"),
            Arc::new(AtomicBool::new(false)),
        );
        assert_eq!(manager.backoff.delay(), Duration::from_secs(2));
        assert_eq!(Backoff::constant(Duration::from_millis(30)).delay(), Duration::from_millis(30));
    }
}
