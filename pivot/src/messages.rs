/// Standardise how messages are read from the turntable
/// telemetry stream. Provide test suite to ensure the wire
/// format is respected.
pub mod telemetry {
    /// Angle messages announce the current table position
    /// and act as capture triggers.
    pub mod angle;
}
