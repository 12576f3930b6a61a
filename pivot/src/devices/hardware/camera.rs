use crate::{
    error::{CameraError, ConfigError},
    utils::image::{encode_jpeg, JpegSplitter},
};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::{Rgb, RgbImage};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, BufRead, BufReader, Read},
    process::{Child, Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use strum_macros::{EnumString, IntoStaticStr};
use uuid::Uuid;

/// Largest MJPEG frame accepted from the capture process.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// The driver used to talk to the camera.
#[derive(
    EnumString, Deserialize, Serialize, IntoStaticStr, Copy, Clone, Debug, Default, PartialEq, Eq,
)]
pub enum CameraBackend {
    /// A video4linux device streamed through an `ffmpeg` child process.
    #[default]
    Ffmpeg,
    /// Generated frames, for running the station on a bench without a camera.
    TestPattern,
}

fn default_device() -> String {
    String::from("/dev/video0")
}

fn default_frame_timeout_ms() -> u64 {
    3_000
}

fn default_jpeg_quality() -> u8 {
    90
}

/// Camera configuration.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CameraConfig {
    /// Which driver to use.
    #[serde(default)]
    pub backend: CameraBackend,
    /// Capture device path.
    #[serde(default = "default_device")]
    pub device: String,
    /// Requested frame width in pixels, the driver default if unset.
    #[serde(default)]
    pub width: Option<u32>,
    /// Requested frame height in pixels, the driver default if unset.
    #[serde(default)]
    pub height: Option<u32>,
    /// Requested frames per second from the device.
    #[serde(default)]
    pub fps: Option<u32>,
    /// video4linux input format such as `mjpeg` or `yuyv422`.
    #[serde(default)]
    pub input_format: Option<String>,
    /// How long a grab waits for a fresh frame.
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
    /// Encoder quality for generated frames, 1 to 100.
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: CameraBackend::default(),
            device: default_device(),
            width: None,
            height: None,
            fps: None,
            input_format: None,
            frame_timeout_ms: default_frame_timeout_ms(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl CameraConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.trim().is_empty() {
            return Err(ConfigError::Invalid("camera.device must not be empty".into()));
        }
        if self.frame_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "camera.frame_timeout_ms must be positive".into(),
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "camera.jpeg_quality must be within 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if self.width == Some(0) || self.height == Some(0) || self.fps == Some(0) {
            return Err(ConfigError::Invalid(
                "camera width, height and fps must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

/// A single still image as delivered by the camera driver.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// JPEG encoded image.
    pub bytes: Vec<u8>,
    /// Time the frame left the driver.
    pub datetime: DateTime<Utc>,
}

impl Frame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            datetime: Utc::now(),
        }
    }
}

/// Driver seam for the camera. Implementations hold the device between
/// `open` and `release`.
pub trait FrameGrabber: Send {
    /// Claim the device.
    fn open(&mut self) -> Result<(), CameraError>;

    /// Block until a frame taken after this call is available. Returns
    /// `CameraError::Disconnected` when the device went away.
    fn grab(&mut self) -> Result<Frame, CameraError>;

    /// Give the device back. Idempotent.
    fn release(&mut self);

    /// Identifier of the device for logging.
    fn device(&self) -> &str;
}

/// Exclusive owner of the capture device for the life of the process. The
/// device is opened lazily and kept open between captures; if it disconnects
/// it is released and the next grab opens it again.
pub struct CameraHandle {
    uuid: Uuid,
    grabber: Box<dyn FrameGrabber>,
    opened: bool,
}

impl CameraHandle {
    /// Wrap a driver. Nothing is opened until `open` or the first `grab`.
    pub fn new(grabber: Box<dyn FrameGrabber>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            grabber,
            opened: false,
        }
    }

    /// Select the driver named by the configuration.
    ///
    /// * `config`: camera section of the station config.
    pub fn from_config(config: &CameraConfig) -> Self {
        let grabber: Box<dyn FrameGrabber> = match config.backend {
            CameraBackend::Ffmpeg => Box::new(FfmpegCamera::new(config.clone())),
            CameraBackend::TestPattern => Box::new(TestPatternCamera::new(config.clone())),
        };
        Self::new(grabber)
    }

    /// Return the unique identifier of the camera.
    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// Open the device now instead of on first use.
    pub fn open(&mut self) -> Result<(), CameraError> {
        if !self.opened {
            self.grabber.open()?;
            self.opened = true;
            info!("Opened camera {}", self.grabber.device());
        }
        Ok(())
    }

    /// Grab one frame. No retry, the caller decides what a miss means.
    pub fn grab(&mut self) -> Result<Frame, CameraError> {
        self.open()?;
        match self.grabber.grab() {
            Err(e @ CameraError::Disconnected(_)) => {
                warn!("Camera {} lost, will reopen on next capture", self.grabber.device());
                self.release();
                Err(e)
            }
            result => result,
        }
    }

    /// Release the device. Idempotent.
    pub fn release(&mut self) {
        if self.opened {
            self.grabber.release();
            self.opened = false;
            debug!("Released camera {}", self.grabber.device());
        }
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Frames from the reader thread. The stream ends with a single error.
type FrameReceiver = Receiver<Result<Frame, CameraError>>;

/// Map a failed receive to the camera error it stands for.
fn receive(frames: &FrameReceiver, timeout: Duration) -> Result<Frame, CameraError> {
    match frames.recv_timeout(timeout) {
        Ok(frame) => frame,
        Err(RecvTimeoutError::Timeout) => Err(CameraError::NoFrame),
        Err(RecvTimeoutError::Disconnected) => {
            Err(CameraError::Disconnected(String::from("capture reader stopped")))
        }
    }
}

/// Wait for a frame that arrives after this call. Queued frames are stale.
fn next_frame(frames: &FrameReceiver, timeout: Duration) -> Result<Frame, CameraError> {
    for stale in frames.try_iter() {
        stale?;
    }
    receive(frames, timeout)
}

struct FfmpegStream {
    child: Child,
    frames: FrameReceiver,
    readers: Vec<JoinHandle<()>>,
}

/// Streams a video4linux device through an `ffmpeg` child process that
/// writes MJPEG to a pipe. A background thread keeps only the most recent
/// frame; a grab returns the first frame that arrives after it was called.
pub struct FfmpegCamera {
    config: CameraConfig,
    stream: Option<FfmpegStream>,
}

impl FfmpegCamera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-f")
            .arg("video4linux2");

        if let Some(input_format) = &self.config.input_format {
            cmd.arg("-input_format").arg(input_format);
        }
        if let (Some(w), Some(h)) = (self.config.width, self.config.height) {
            cmd.arg("-video_size").arg(format!("{w}x{h}"));
        }
        if let Some(fps) = self.config.fps {
            cmd.arg("-framerate").arg(fps.to_string());
        }

        cmd.arg("-i")
            .arg(&self.config.device)
            .arg("-an")
            .arg("-f")
            .arg("image2pipe")
            .arg("-c:v")
            .arg("mjpeg")
            .arg("-q:v")
            .arg("2")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

/// Pump the child's stdout into the channel until the pipe closes, then
/// send the reason as a `Disconnected` error. Frames nobody is waiting for
/// are dropped so the pipe never backs up.
fn read_frames(mut stdout: impl Read, tx: Sender<Result<Frame, CameraError>>) {
    let mut splitter = JpegSplitter::new(MAX_FRAME_LEN);
    let mut chunk = vec![0_u8; 64 * 1024];
    let reason = loop {
        match stdout.read(&mut chunk) {
            Ok(0) => break String::from("capture process exited"),
            Ok(n) => {
                for frame in splitter.push(&chunk[..n]) {
                    match tx.try_send(Ok(Frame::new(frame))) {
                        Ok(()) | Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break format!("capture pipe failed: {e}"),
        }
    };
    let _ = tx.send(Err(CameraError::Disconnected(reason)));
}

/// Forward the capture process diagnostics into the log. Returns the number
/// of lines forwarded once the pipe closes.
fn forward_stderr(stderr: impl Read, device: &str) -> usize {
    let mut forwarded = 0;
    for line in BufReader::new(stderr).lines() {
        let Ok(line) = line else { break };
        if !line.trim().is_empty() {
            warn!("ffmpeg ({device}): {line}");
            forwarded += 1;
        }
    }
    forwarded
}

impl FrameGrabber for FfmpegCamera {
    fn open(&mut self) -> Result<(), CameraError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut child = self.command().spawn().map_err(CameraError::Spawn)?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CameraError::NotOpened(self.config.device.clone()));
        };

        let (tx, frames) = bounded(1);
        let device = self.config.device.clone();
        let readers = vec![
            thread::spawn(move || read_frames(stdout, tx)),
            thread::spawn(move || {
                forward_stderr(stderr, &device);
            }),
        ];
        let stream = FfmpegStream {
            child,
            frames,
            readers,
        };

        // The device only counts as open once it produced a frame.
        if let Err(e) = receive(&stream.frames, self.config.frame_timeout()) {
            warn!("Camera {} produced no frame: {e}", self.config.device);
            shutdown(stream);
            return Err(CameraError::NotOpened(self.config.device.clone()));
        }
        self.stream = Some(stream);
        Ok(())
    }

    fn grab(&mut self) -> Result<Frame, CameraError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| CameraError::NotOpened(self.config.device.clone()))?;
        next_frame(&stream.frames, self.config.frame_timeout())
    }

    fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            shutdown(stream);
        }
    }

    fn device(&self) -> &str {
        &self.config.device
    }
}

fn shutdown(stream: FfmpegStream) {
    let FfmpegStream {
        mut child,
        frames,
        readers,
    } = stream;
    if let Err(e) = child.kill() {
        debug!("Capture process already gone: {e}");
    }
    let _ = child.wait();
    // Unblocks a reader waiting to report the end of the stream.
    drop(frames);
    for reader in readers {
        let _ = reader.join();
    }
}

/// Generates a gradient frame that shifts on every grab.
pub struct TestPatternCamera {
    config: CameraConfig,
    opened: bool,
    counter: u32,
}

impl TestPatternCamera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            opened: false,
            counter: 0,
        }
    }

    fn pattern(&self) -> RgbImage {
        let width = self.config.width.unwrap_or(640);
        let height = self.config.height.unwrap_or(480);
        let shift = self.counter.wrapping_mul(8);
        let blue = (self.counter % 256) as u8;
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x.wrapping_add(shift) % 256) as u8, (y % 256) as u8, blue])
        })
    }
}

impl FrameGrabber for TestPatternCamera {
    fn open(&mut self) -> Result<(), CameraError> {
        self.opened = true;
        Ok(())
    }

    fn grab(&mut self) -> Result<Frame, CameraError> {
        if !self.opened {
            return Err(CameraError::NotOpened(self.config.device.clone()));
        }
        self.counter = self.counter.wrapping_add(1);
        let bytes = encode_jpeg(&self.pattern(), self.config.jpeg_quality)?;
        Ok(Frame::new(bytes))
    }

    fn release(&mut self) {
        self.opened = false;
    }

    fn device(&self) -> &str {
        "test-pattern"
    }
}


#[cfg(test)]
mod tests {

    use super::testing::{GrabStep, ScriptedGrabber};
    use super::*;
    use crate::utils::image::is_jpeg;
    use std::{io::Cursor, str::FromStr, sync::atomic::Ordering};

    #[test]
    fn test_open_lazily_and_keep_open() {
        let grabber = ScriptedGrabber::always_ok();
        let opens = grabber.opens.clone();
        let mut camera = CameraHandle::new(Box::new(grabber));
        assert!(!camera.is_open());

        camera.grab().expect("Failed to grab");
        camera.grab().expect("Failed to grab");
        assert!(camera.is_open());
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_failure_is_retried_on_next_grab() {
        let mut grabber = ScriptedGrabber::always_ok();
        grabber.open_failures = 1;
        let opens = grabber.opens.clone();
        let mut camera = CameraHandle::new(Box::new(grabber));

        assert!(matches!(camera.grab(), Err(CameraError::NotOpened(_))));
        assert!(camera.grab().is_ok());
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disconnect_releases_and_reopens() {
        let grabber = ScriptedGrabber::new(vec![GrabStep::Disconnect]);
        let opens = grabber.opens.clone();
        let mut camera = CameraHandle::new(Box::new(grabber));

        assert!(matches!(camera.grab(), Err(CameraError::Disconnected(_))));
        assert!(!camera.is_open());
        assert!(camera.grab().is_ok());
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_no_frame_keeps_device_open() {
        let grabber = ScriptedGrabber::new(vec![GrabStep::NoFrame]);
        let mut camera = CameraHandle::new(Box::new(grabber));
        assert!(matches!(camera.grab(), Err(CameraError::NoFrame)));
        assert!(camera.is_open());
    }

    #[test]
    fn test_test_pattern_produces_distinct_jpegs() {
        let config = CameraConfig {
            backend: CameraBackend::TestPattern,
            width: Some(64),
            height: Some(32),
            ..CameraConfig::default()
        };
        let mut camera = CameraHandle::from_config(&config);
        let first = camera.grab().expect("Failed to grab");
        let second = camera.grab().expect("Failed to grab");
        assert!(is_jpeg(&first.bytes));
        assert_ne!(first.bytes, second.bytes);
    }

    #[test]
    fn test_reader_ends_stream_with_disconnect() {
        let (tx, rx) = bounded(4);
        let mut stream = b"junk\xFF\xD8one\xFF\xD9".to_vec();
        stream.extend_from_slice(b"\xFF\xD8two\xFF\xD9");
        read_frames(Cursor::new(stream), tx);

        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(received.len(), 3);
        assert!(matches!(&received[0], Ok(frame) if frame.bytes == b"\xFF\xD8one\xFF\xD9"));
        assert!(matches!(&received[1], Ok(frame) if frame.bytes == b"\xFF\xD8two\xFF\xD9"));
        assert!(matches!(&received[2], Err(CameraError::Disconnected(_))));
    }

    #[test]
    fn test_reader_drops_frames_nobody_waits_for() {
        let (tx, rx) = bounded(1);
        let mut stream = Vec::new();
        for body in [&b"a"[..], b"b", b"c"] {
            stream.extend_from_slice(b"\xFF\xD8");
            stream.extend_from_slice(body);
            stream.extend_from_slice(b"\xFF\xD9");
        }
        // The end of stream report blocks until a receiver makes room.
        let reader = thread::spawn(move || read_frames(Cursor::new(stream), tx));
        thread::sleep(Duration::from_millis(50));

        let first = rx.recv().expect("Reader hung up");
        assert_eq!(first.expect("Expected a frame").bytes, b"\xFF\xD8a\xFF\xD9");
        assert!(matches!(rx.recv(), Ok(Err(CameraError::Disconnected(_)))));
        reader.join().expect("Failed to join reader");
    }

    #[test]
    fn test_grab_skips_queued_frame_and_times_out() {
        let (tx, rx) = bounded(1);
        tx.send(Ok(Frame::new(vec![1]))).expect("Failed to send");

        let result = next_frame(&rx, Duration::from_millis(10));
        assert!(matches!(result, Err(CameraError::NoFrame)));
    }

    #[test]
    fn test_grab_returns_frame_arriving_after_call() {
        let (tx, rx) = bounded(1);
        tx.send(Ok(Frame::new(vec![1]))).expect("Failed to send");
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.send(Ok(Frame::new(vec![2]))).expect("Failed to send");
        });

        let frame = next_frame(&rx, Duration::from_secs(2)).expect("Failed to grab");
        assert_eq!(frame.bytes, vec![2]);
        sender.join().expect("Failed to join sender");
    }

    #[test]
    fn test_grab_reports_ended_stream() {
        let (tx, rx) = bounded(2);
        tx.send(Ok(Frame::new(vec![1]))).expect("Failed to send");
        tx.send(Err(CameraError::Disconnected("exited".into())))
            .expect("Failed to send");
        drop(tx);

        assert!(matches!(
            next_frame(&rx, Duration::from_millis(10)),
            Err(CameraError::Disconnected(_))
        ));
        assert!(matches!(
            next_frame(&rx, Duration::from_millis(10)),
            Err(CameraError::Disconnected(_))
        ));
    }

    #[test]
    fn test_forward_capture_diagnostics() {
        let stderr = b"[video4linux2] Cannot open video device\n\nDevice busy\n".to_vec();
        assert_eq!(forward_stderr(Cursor::new(stderr), "/dev/video0"), 2);
    }

    #[test]
    fn test_backend_from_string() {
        assert_eq!(CameraBackend::from_str("TestPattern"), Ok(CameraBackend::TestPattern));
        let name: &'static str = CameraBackend::Ffmpeg.into();
        assert_eq!(name, "Ffmpeg");
    }

    #[test]
    fn test_validate_camera_config() {
        assert!(CameraConfig::default().validate().is_ok());
        let config = CameraConfig {
            jpeg_quality: 0,
            ..CameraConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[cfg_attr(not(feature = "hardware_test"), ignore)]
    #[test]
    /// Grab a frame from the default video4linux device through ffmpeg.
    fn test_ffmpeg_grab_from_hardware() {
        let mut camera = CameraHandle::from_config(&CameraConfig::default());
        let frame = camera.grab().expect("Failed to grab from camera");
        assert!(is_jpeg(&frame.bytes));
    }
}
