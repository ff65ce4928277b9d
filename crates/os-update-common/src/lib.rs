//! Common plumbing shared by the update tool's subsystems: external-utility
//! invocation, mount and loop-device handles, image decompression, hashing,
//! and filesystem helpers.

pub mod cmd;
pub mod decompress;
pub mod error;
pub mod fsutils;
pub mod loop_dev;
pub mod mount;
pub mod stream_hasher;
pub mod uuid;

pub use error::{Result, ToolError};
