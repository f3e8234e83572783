pub mod edata;
pub mod frame;
pub mod properties;

pub use edata::*;
pub use frame::*;
pub use properties::*;

/// ECHONET LiteのUDPポート番号
pub const UDP_PORT: u16 = 0x0E1A;
