pub mod capture;
pub mod convert;
pub mod device;
pub mod playback;

pub use capture::CpalCapture;
pub use device::{default_input_device_name, list_input_devices, list_output_devices};
pub use playback::CpalPlayback;
