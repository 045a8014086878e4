//! Utility modules for device transfer and memory accounting.

mod device;
mod memory;

pub use device::{get_device, parse_device, parse_dtype, CandleTransfer, DeviceTransfer};
pub use memory::format_bytes;
