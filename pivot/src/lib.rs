/**
The pivot capture station watches the angle telemetry reported by a turntable
microcontroller over a serial link and archives a still image from the attached
camera each time the table reaches one of the configured angles. The crate keeps
the layout used across the control system: atomic devices are composed into
components, and components are driven by controllers that own the run loop.
*/

/// Components in the system are created by grouping together
/// devices into a logical unit that performs some function
/// for the capture station.
pub mod components;
/// Devices that are an atomic unit, and can be composed 
/// with other devices into components to perform some function.
pub mod devices;
/// Error types shared by devices and components.
pub mod error;
/// Message structure for communication into the capture station,
/// such as the angle telemetry of the turntable.
pub mod messages;
/// Development utilities for working with images and test fixtures.
pub mod utils;
