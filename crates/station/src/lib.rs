//! Station controller and its actor handle

pub mod controller;
pub mod error;
pub mod handle;

pub use controller::{StationController, StationEvent};
pub use error::StationError;
pub use handle::{spawn_station, StationHandle};
