use crate::{
    error::{ArchiveError, ConfigError},
    messages::telemetry::angle::AngleMarker,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Component, Path, PathBuf},
};
use uuid::Uuid;

/// Prefix of every archived image.
pub const CAPTURE_PREFIX: &str = "capture_";
/// Extension of every archived image.
pub const CAPTURE_EXTENSION: &str = "jpg";
/// How many sequence numbers are tried when other writers keep claiming them.
const MAX_PUBLISH_ATTEMPTS: u64 = 64;

/// Maps one angle to the directory its captures are written to.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct BucketConfig {
    /// Angle that triggers a capture into this bucket.
    pub angle: AngleMarker,
    /// Directory name relative to the archive root.
    pub directory: String,
}

/// Archive configuration.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// Parent directory of every bucket.
    pub root: PathBuf,
    /// Angle to bucket mapping. Only these angles trigger a capture.
    pub buckets: Vec<BucketConfig>,
}

impl ArchiveConfig {
    /// Create a new archive config with no buckets.
    ///
    /// * `root`: parent directory for the bucket directories.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            buckets: Vec::new(),
        }
    }

    /// Add a bucket to the config.
    ///
    /// * `degrees`: angle that selects the bucket.
    /// * `directory`: single directory name under the root.
    pub fn add_bucket(mut self, degrees: i32, directory: impl Into<String>) -> Self {
        self.buckets.push(BucketConfig {
            angle: AngleMarker::new(degrees),
            directory: directory.into(),
        });
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("archive.root must not be empty".into()));
        }
        if self.buckets.is_empty() {
            return Err(ConfigError::Invalid(
                "archive.buckets must map at least one angle".into(),
            ));
        }

        let mut angles = HashSet::new();
        let mut directories = HashSet::new();
        for bucket in &self.buckets {
            if !is_plain_name(&bucket.directory) {
                return Err(ConfigError::Invalid(format!(
                    "bucket directory {:?} for {} must be a single plain name",
                    bucket.directory, bucket.angle
                )));
            }
            if !angles.insert(bucket.angle) {
                return Err(ConfigError::Invalid(format!(
                    "angle {} is mapped more than once",
                    bucket.angle
                )));
            }
            if !directories.insert(bucket.directory.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "bucket directory {:?} is used more than once",
                    bucket.directory
                )));
            }
        }
        Ok(())
    }
}

/// True for a name that stays inside its parent: one normal component.
fn is_plain_name(name: &str) -> bool {
    if name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// File name of the image with the given sequence number.
pub fn capture_file_name(sequence: u64) -> String {
    format!("{CAPTURE_PREFIX}{sequence}.{CAPTURE_EXTENSION}")
}

/// Sequence number of an archived image name, `None` for any other file.
pub fn parse_capture_file_name(name: &str) -> Option<u64> {
    let digits = name
        .strip_prefix(CAPTURE_PREFIX)?
        .strip_suffix(CAPTURE_EXTENSION)?
        .strip_suffix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|sequence| *sequence > 0)
}

/// A named capture destination backed by one directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveBucket {
    marker: AngleMarker,
    name: String,
    directory: PathBuf,
}

impl ArchiveBucket {
    pub fn marker(&self) -> AngleMarker {
        self.marker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Next free sequence number, derived from the directory every time so
    /// restarts and other writers are accounted for. Only `capture_<n>.jpg`
    /// names count, so stray files never shift or reuse a number.
    pub fn next_sequence(&self) -> Result<u64, ArchiveError> {
        Ok(self.max_sequence()? + 1)
    }

    /// Highest sequence number on disk, zero for a missing or empty bucket.
    pub fn max_sequence(&self) -> Result<u64, ArchiveError> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(ArchiveError::Scan {
                    path: self.directory.clone(),
                    source,
                })
            }
        };

        let mut max = 0;
        for entry in entries {
            let entry = entry.map_err(|source| ArchiveError::Scan {
                path: self.directory.clone(),
                source,
            })?;
            if let Some(sequence) = entry.file_name().to_str().and_then(parse_capture_file_name) {
                max = max.max(sequence);
            }
        }
        Ok(max)
    }
}

/// An image that has been published into a bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedImage {
    /// Name of the bucket the image went to.
    pub bucket: String,
    /// Position of the image within its bucket, starting at 1.
    pub sequence: u64,
    /// Final path of the image.
    pub path: PathBuf,
    /// Encoded size in bytes.
    pub size: usize,
}

/// File operations behind `ArchiveStore::save`.
#[derive(Clone, Copy)]
struct FileOps {
    /// Write and sync a new file.
    write: fn(&Path, &[u8]) -> io::Result<()>,
    /// Claim the final name without replacing an existing file.
    publish: fn(&Path, &Path) -> io::Result<()>,
}

const SYSTEM_FILE_OPS: FileOps = FileOps {
    write: write_synced,
    publish,
};

/// Writes images into per angle bucket directories with never reused,
/// increasing sequence numbers.
pub struct ArchiveStore {
    root: PathBuf,
    buckets: HashMap<AngleMarker, ArchiveBucket>,
    ops: FileOps,
}

impl ArchiveStore {
    /// Create an archive store by consuming a validated config. Directories
    /// are created on demand, not here.
    ///
    /// * `config`: archive section of the station config.
    pub fn new(config: ArchiveConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let buckets = config
            .buckets
            .into_iter()
            .map(|bucket| {
                let archive_bucket = ArchiveBucket {
                    marker: bucket.angle,
                    directory: config.root.join(&bucket.directory),
                    name: bucket.directory,
                };
                (bucket.angle, archive_bucket)
            })
            .collect();
        Ok(Self {
            root: config.root,
            buckets,
            ops: SYSTEM_FILE_OPS,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The bucket an angle maps to, `None` if the angle is not configured.
    pub fn bucket_for(&self, marker: AngleMarker) -> Option<&ArchiveBucket> {
        self.buckets.get(&marker)
    }

    pub fn buckets(&self) -> impl Iterator<Item = &ArchiveBucket> {
        self.buckets.values()
    }

    /// Make every temporary write fail after a partial write, as a full
    /// disk would.
    #[cfg(test)]
    pub(crate) fn with_failing_writes(mut self) -> Self {
        self.ops.write = |path, bytes| {
            fs::write(path, &bytes[..bytes.len() / 2])?;
            Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
        };
        self
    }

    /// Persist one image under the bucket's next sequence number. The bytes
    /// are written to a hidden temporary file first, so a partial image is
    /// never visible under a final name. A failed save leaves the bucket
    /// untouched.
    ///
    /// * `bucket`: destination bucket.
    /// * `bytes`: encoded image.
    pub fn save(&self, bucket: &ArchiveBucket, bytes: &[u8]) -> Result<CapturedImage, ArchiveError> {
        let directory = bucket.directory();
        fs::create_dir_all(directory).map_err(|source| ArchiveError::CreateDir {
            path: directory.to_path_buf(),
            source,
        })?;

        let mut sequence = bucket.next_sequence()?;
        let temp_path = directory.join(format!(".{}.tmp", Uuid::new_v4()));
        if let Err(source) = (self.ops.write)(&temp_path, bytes) {
            discard(&temp_path);
            return Err(ArchiveError::Write {
                path: temp_path,
                source,
            });
        }

        for _ in 0..MAX_PUBLISH_ATTEMPTS {
            let path = directory.join(capture_file_name(sequence));
            match (self.ops.publish)(&temp_path, &path) {
                Ok(()) => {
                    info!("Captured image saved as {}", path.display());
                    return Ok(CapturedImage {
                        bucket: bucket.name.clone(),
                        sequence,
                        path,
                        size: bytes.len(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("{} was claimed by another writer", path.display());
                    sequence += 1;
                }
                Err(source) => {
                    discard(&temp_path);
                    return Err(ArchiveError::Publish { path, source });
                }
            }
        }

        discard(&temp_path);
        Err(ArchiveError::Exhausted {
            directory: directory.to_path_buf(),
        })
    }
}

/// Remove a temporary file. It is hidden, so a failure only costs space.
fn discard(temp_path: &Path) {
    match fs::remove_file(temp_path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove temporary file {}: {e}", temp_path.display()),
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Move the temporary file to its final name without ever replacing an
/// existing image. A hard link fails if the name is taken; filesystems
/// without links fall back to a checked rename.
fn publish(temp_path: &Path, path: &Path) -> io::Result<()> {
    match fs::hard_link(temp_path, path) {
        Ok(()) => {
            discard(temp_path);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        Err(e) => {
            debug!("Hard link unavailable ({e}), renaming instead");
            if path.exists() {
                return Err(io::ErrorKind::AlreadyExists.into());
            }
            fs::rename(temp_path, path)
        }
    }
}
