use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

/// Prefix of the telemetry line that announces the table position.
pub const ANGLE_PREFIX: &str = "Angle:";

/// Angle in whole degrees reported by the turntable. Only markers that are
/// mapped to a bucket trigger a capture, any other value is plain telemetry.
#[derive(Eq, PartialEq, Hash, Copy, Clone, Debug, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct AngleMarker(i32);

impl AngleMarker {
    pub fn new(degrees: i32) -> Self {
        Self(degrees)
    }

    pub fn degrees(&self) -> i32 {
        self.0
    }

    /// Parse a decoded telemetry line of the form `Angle: <N>`. Lines
    /// that do not follow the format are not markers and return `None`.
    ///
    /// * `line`: a single line with the terminator already stripped.
    pub fn from_line(line: &str) -> Option<Self> {
        line.parse().ok()
    }
}

impl Display for AngleMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}°", self.0)
    }
}

/// The line was not an angle message.
#[derive(Debug, PartialEq, Eq)]
pub struct NotAnAngle;

impl FromStr for AngleMarker {
    type Err = NotAnAngle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().strip_prefix(ANGLE_PREFIX).ok_or(NotAnAngle)?;
        // The firmware prints a single space after the colon, tolerate more.
        let value = value.trim_start();
        if value.is_empty() || value.starts_with('+') {
            return Err(NotAnAngle);
        }
        value.parse::<i32>().map(Self).map_err(|_| NotAnAngle)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Angle: 45", 45)]
    #[case("Angle: 5", 5)]
    #[case("Angle: 0", 0)]
    #[case("Angle: -30", -30)]
    #[case("Angle:70", 70)]
    #[case("Angle:   48", 48)]
    #[case("  Angle: 99  ", 99)]
    fn test_parse_angle_message(#[case] line: &str, #[case] degrees: i32) {
        assert_eq!(AngleMarker::from_line(line), Some(AngleMarker::new(degrees)));
    }

    #[rstest]
    #[case("")]
    #[case("Angle:")]
    #[case("Angle: ")]
    #[case("Angle: 45.5")]
    #[case("Angle: +45")]
    #[case("Angle: 45 deg")]
    #[case("angle: 45")]
    #[case("Speed: 45")]
    #[case("Angle: 99999999999")]
    #[case("Motor stalled, Angle: 45")]
    fn test_reject_other_telemetry(#[case] line: &str) {
        assert_eq!(AngleMarker::from_line(line), None);
    }

    #[test]
    fn test_display_in_degrees() {
        assert_eq!(AngleMarker::new(45).to_string(), "45°");
    }
}
