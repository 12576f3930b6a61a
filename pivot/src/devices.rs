/// Devices are the atomic units that can be combined together
/// into components. Their core responsibilities do not change 
/// based on location, name etc.
pub mod hardware {
    /// Device interface for the still camera.
    pub mod camera;
    /// Device interface for the serial link to the turntable.
    pub mod serial;
}
