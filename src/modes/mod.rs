// Mode S message model and frame decoding

pub mod crc;
pub mod altitude;
pub mod cpr;
pub mod message;
pub mod frame;
pub mod modeac;

pub use frame::{decode_frame, FrameError};
pub use message::{AddrType, AirGround, CprType, HeadingType, Message, Source};
