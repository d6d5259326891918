pub(crate) mod bytes;
mod windows;

pub use self::windows::SystemTime;
pub(crate) use self::windows::{filetime_to_systemtime, local_bias_minutes, systemtime_to_filetime};
