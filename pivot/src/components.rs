/// Components that are placed on the turntable rig.
pub mod turntable {
    /// Long lived ownership of the serial link, reconnecting on loss.
    pub mod connection;
    /// Directory backed storage of the captured images.
    pub mod archive;
    /// Turns angle messages into camera captures.
    pub mod dispatcher;
    /// The station that wires the connection and dispatcher into a read loop.
    pub mod capture_station;
}

/// Helpful prelude when working with components.
pub mod prelude {
    pub use crate::components::turntable::archive::*;
    pub use crate::components::turntable::capture_station::*;
    pub use crate::components::turntable::connection::*;
    pub use crate::components::turntable::dispatcher::*;
}
