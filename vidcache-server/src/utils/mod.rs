mod size;
mod time;

pub use self::size::{GIB, format_bytes, parse_size};
pub use self::time::parse_time;
