// src/protocol/mod.rs
//
// Reader wire protocol: frame codec, command builders and response dispatch.

pub mod codec;
pub mod commands;
pub mod dispatch;

pub use codec::{decode_frame, encode_frame, DecodedFrame, FrameError, BROADCAST_READER_ID};
pub use commands::{AntennaConfig, BeeperMode, CommandError, ReaderCommand, Region, RfProfile};
pub use dispatch::{dispatch, CommandFailure, ReaderEvent, TagRead};
