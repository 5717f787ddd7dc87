//! Protocol frame codecs.

pub mod dfu;
pub mod isp;

pub use dfu::{DfuCodec, DfuCommand};
pub use isp::{IspCodec, Opcode, checksum};
