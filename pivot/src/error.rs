use std::{io, path::PathBuf};
use thiserror::Error;

/// Startup configuration errors. These are the only errors that stop the
/// station, and they are raised before the read loop begins.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file does not exist.
    #[error("Could not locate the config file {0:?}")]
    MissingFile(PathBuf),

    /// The config crate failed to read or deserialise the sources.
    #[error("Failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    /// Values parsed but are not usable.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Serial link errors. Always transient from the point of view of the station.
#[derive(Error, Debug)]
pub enum SerialError {
    /// The port could not be opened.
    #[error("Failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    /// The open port failed mid stream.
    #[error("Serial I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Camera errors, scoped to a single capture event.
#[derive(Error, Debug)]
pub enum CameraError {
    /// The device could not be opened.
    #[error("Camera {0} could not be opened")]
    NotOpened(String),

    /// The device is open but did not deliver a frame in time.
    #[error("Camera did not return a frame")]
    NoFrame,

    /// The device went away; the handle will reopen it on the next grab.
    #[error("Camera disconnected: {0}")]
    Disconnected(String),

    /// The capture process could not be spawned.
    #[error("Failed to spawn capture process: {0}")]
    Spawn(#[source] io::Error),

    /// A synthetic frame could not be encoded.
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
}

/// Archive persistence errors, scoped to a single capture event.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to create bucket directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to scan bucket directory {path:?}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write image {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to publish image {path:?}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Every candidate sequence number was claimed by another writer.
    #[error("No free sequence number in {directory:?}")]
    Exhausted { directory: PathBuf },
}
