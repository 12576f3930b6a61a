use crate::{
    components::turntable::{
        archive::{ArchiveConfig, ArchiveStore},
        connection::{ConnectionManager, ConnectionStats},
        dispatcher::{CaptureDispatcher, CaptureOutcome},
    },
    devices::hardware::{
        camera::{CameraConfig, CameraHandle},
        serial::{PortOpener, SerialConfig, SystemPortOpener},
    },
    error::ConfigError,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsStr,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};
use uuid::Uuid;

/// Prefix of environment variables that override the config file, e.g.
/// `ANGLE_CAPTURE_SERIAL__PORT=/dev/ttyUSB1`.
pub const ENV_PREFIX: &str = "ANGLE_CAPTURE";

/// As with all elements in the system, a configuration struct is consumed
/// to create the component, which in turn owns the devices composed into it.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CaptureStationConfig {
    /// Serial link to the turntable.
    pub serial: SerialConfig,
    /// Capture device.
    #[serde(default)]
    pub camera: CameraConfig,
    /// Where images go and which angles trigger them.
    pub archive: ArchiveConfig,
}

impl CaptureStationConfig {
    /// Create a station config with the default camera.
    ///
    /// * `serial`: serial link settings.
    /// * `archive`: archive root and bucket mapping.
    pub fn new(serial: SerialConfig, archive: ArchiveConfig) -> Self {
        Self {
            serial,
            camera: CameraConfig::default(),
            archive,
        }
    }

    /// Replace the camera settings.
    pub fn with_camera(mut self, camera: CameraConfig) -> Self {
        self.camera = camera;
        self
    }

    /// Read the config from a YAML file, apply environment overrides and
    /// validate the result.
    ///
    /// * `filepath`: path to the station config.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, ConfigError> {
        let file = Path::new(&filepath);
        if !file.is_file() {
            return Err(ConfigError::MissingFile(file.to_path_buf()));
        }
        let config_file = config::Config::builder()
            .add_source(config::File::new(
                &file.to_string_lossy(),
                config::FileFormat::Yaml,
            ))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let station_config = config_file.try_deserialize::<CaptureStationConfig>()?;
        station_config.validate()?;
        Ok(station_config)
    }

    /// Reject misconfiguration before anything is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.serial.validate()?;
        self.camera.validate()?;
        self.archive.validate()
    }
}

/// Running totals of what the read loop did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StationStats {
    /// Lines received.
    pub lines: u64,
    /// Angle messages with no bucket.
    pub unmatched: u64,
    /// Images archived.
    pub saved: u64,
    /// Captures lost to the camera.
    pub capture_failures: u64,
    /// Captures lost to the filesystem.
    pub save_failures: u64,
}

impl StationStats {
    fn record(&mut self, outcome: &CaptureOutcome) {
        self.lines += 1;
        match outcome {
            CaptureOutcome::Ignored => {}
            CaptureOutcome::Unmatched(_) => self.unmatched += 1,
            CaptureOutcome::Saved(_) => self.saved += 1,
            CaptureOutcome::CaptureFailed(..) => self.capture_failures += 1,
            CaptureOutcome::SaveFailed(..) => self.save_failures += 1,
        }
    }
}

/// Component that wires the serial link to the camera and archive. One link,
/// one camera; everything runs on the thread that drives the read loop.
pub struct CaptureStation<O: PortOpener = SystemPortOpener> {
    /// Unique id of the station, helpful for trouble shooting and logging.
    uuid: Uuid,
    connection: ConnectionManager<O>,
    dispatcher: CaptureDispatcher,
    stop_signal: Arc<AtomicBool>,
    stats: StationStats,
}

impl CaptureStation<SystemPortOpener> {
    /// Create a station for real hardware by consuming a config.
    ///
    /// * `config`: station config.
    pub fn new(config: CaptureStationConfig) -> Result<Self, ConfigError> {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let camera = CameraHandle::from_config(&config.camera);
        Self::with_opener(SystemPortOpener, camera, config, stop_signal)
    }

    /// Create a station by ingesting a config file.
    ///
    /// * `filepath`: filepath to the config.
    pub fn from_config_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, ConfigError> {
        Self::new(CaptureStationConfig::from_file(filepath)?)
    }
}

impl<O: PortOpener> CaptureStation<O> {
    /// Assemble a station from an explicit opener and camera.
    ///
    /// * `opener`: primitive used for every serial open attempt.
    /// * `camera`: handle to the capture device.
    /// * `config`: station config, validated here.
    /// * `stop_signal`: shared flag that ends the read loop.
    pub fn with_opener(
        opener: O,
        camera: CameraHandle,
        config: CaptureStationConfig,
        stop_signal: Arc<AtomicBool>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let archive = ArchiveStore::new(config.archive)?;
        Ok(Self {
            uuid: Uuid::new_v4(),
            connection: ConnectionManager::new(opener, config.serial, stop_signal.clone()),
            dispatcher: CaptureDispatcher::new(camera, archive),
            stop_signal,
            stats: StationStats::default(),
        })
    }

    /// Return the unique id of the station.
    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    /// Shared flag; raising it stops the read loop within one read timeout.
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        self.stop_signal.clone()
    }

    pub fn stats(&self) -> StationStats {
        self.stats
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.connection.stats()
    }

    /// Close the serial link and release the camera.
    pub fn shutdown(&mut self) {
        self.connection.close();
        self.dispatcher.camera_mut().release();
    }
}

/// Unit struct to link component controller behaviour. The station holds the
/// state, the controller runs it.
pub struct CaptureStationController;

impl CaptureStationController {
    /// Run the read loop on the calling thread until the station's stop
    /// signal is raised. Each line is dispatched, captured and saved before
    /// the next one is read. Nothing in the loop is fatal.
    ///
    /// * `station`: the station to drive.
    pub fn run<O: PortOpener>(station: &mut CaptureStation<O>) -> StationStats {
        info!(
            "Capture station {} listening on {}, archiving under {}",
            station.uuid,
            station.connection.config().port,
            station.dispatcher.archive().root().display()
        );
        for bucket in station.dispatcher.archive().buckets() {
            info!(
                "{} -> {}",
                bucket.marker(),
                bucket.directory().display()
            );
        }
        if let Err(e) = station.dispatcher.camera_mut().open() {
            warn!("Camera not ready ({e}), will retry on the first capture");
        }

        while let Some(line) = station.connection.next_line() {
            let outcome = station.dispatcher.on_line(&line);
            station.stats.record(&outcome);
        }

        station.shutdown();
        info!(
            "Capture station {} stopped: {:?} {:?}",
            station.uuid,
            station.stats,
            station.connection.stats()
        );
        station.stats
    }

    /// Start the read loop on its own thread. The station is handed back
    /// through the join handle once the stop signal is raised.
    ///
    /// * `station`: the station to drive.
    pub fn start<O>(mut station: CaptureStation<O>) -> (JoinHandle<CaptureStation<O>>, Arc<AtomicBool>)
    where
        O: PortOpener + Send + 'static,
    {
        let stop_signal = station.stop_signal();
        let handle = thread::spawn(move || {
            Self::run(&mut station);
            station
        });
        (handle, stop_signal)
    }

    /// Request a running station to stop.
    pub fn stop(stop_signal: &AtomicBool) {
        stop_signal.store(true, Ordering::Relaxed);
    }
}
