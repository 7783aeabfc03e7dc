//! Audio frames, companding and tone synthesis.

pub mod codec;
pub mod dtmf;
pub mod frame;

pub use frame::{AudioEncoding, AudioFrame};
