use crate::{
    components::turntable::archive::{ArchiveStore, CapturedImage},
    devices::hardware::camera::CameraHandle,
    error::{ArchiveError, CameraError},
    messages::telemetry::angle::AngleMarker,
};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};

/// A capture triggered by an angle message. Built on match and consumed
/// straight away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureRequest {
    pub marker: AngleMarker,
    pub requested_at: DateTime<Utc>,
}

impl CaptureRequest {
    pub fn new(marker: AngleMarker) -> Self {
        Self {
            marker,
            requested_at: Utc::now(),
        }
    }
}

/// What happened to a single telemetry line.
#[derive(Debug)]
pub enum CaptureOutcome {
    /// Not an angle message.
    Ignored,
    /// An angle with no bucket configured.
    Unmatched(AngleMarker),
    /// The image was archived.
    Saved(CapturedImage),
    /// The camera did not deliver a frame, nothing was written.
    CaptureFailed(AngleMarker, CameraError),
    /// The frame could not be persisted, nothing was written.
    SaveFailed(AngleMarker, ArchiveError),
}

impl CaptureOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, CaptureOutcome::Saved(_))
    }
}

/// Turns decoded telemetry lines into archived images. Owns the camera and
/// the archive; a grab needs `&mut self`, so at most one capture is in flight.
pub struct CaptureDispatcher {
    camera: CameraHandle,
    archive: ArchiveStore,
}

impl CaptureDispatcher {
    /// * `camera`: the only handle to the capture device.
    /// * `archive`: destination of the captured images.
    pub fn new(camera: CameraHandle, archive: ArchiveStore) -> Self {
        Self { camera, archive }
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.archive
    }

    pub fn camera_mut(&mut self) -> &mut CameraHandle {
        &mut self.camera
    }

    /// Handle one line of telemetry. Only angles mapped to a bucket reach
    /// the camera; failures are logged and reported, never retried.
    ///
    /// * `line`: decoded line without terminator.
    pub fn on_line(&mut self, line: &str) -> CaptureOutcome {
        debug!("Received: {line}");
        let Some(marker) = AngleMarker::from_line(line) else {
            return CaptureOutcome::Ignored;
        };
        if self.archive.bucket_for(marker).is_none() {
            info!("No bucket configured for {marker}, discarding");
            return CaptureOutcome::Unmatched(marker);
        }
        self.capture(CaptureRequest::new(marker))
    }

    /// Grab a frame and archive it under the request's bucket.
    pub fn capture(&mut self, request: CaptureRequest) -> CaptureOutcome {
        let Some(bucket) = self.archive.bucket_for(request.marker) else {
            return CaptureOutcome::Unmatched(request.marker);
        };

        let frame = match self.camera.grab() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to capture image for {}: {e}", request.marker);
                return CaptureOutcome::CaptureFailed(request.marker, e);
            }
        };
        debug!(
            "Grabbed {} bytes for {} in {} ms",
            frame.bytes.len(),
            request.marker,
            (frame.datetime - request.requested_at).num_milliseconds()
        );

        match self.archive.save(bucket, &frame.bytes) {
            Ok(image) => CaptureOutcome::Saved(image),
            Err(e) => {
                warn!("Failed to save image for {}: {e}", request.marker);
                CaptureOutcome::SaveFailed(request.marker, e)
            }
        }
    }
}
