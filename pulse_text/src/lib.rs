//! Text exposition codec: encodes snapshots into the line-based scrape
//! format and decodes the inverse, tolerating partial input.

pub mod decode;
pub mod encode;

pub use decode::{decode, DecodeError};
pub use encode::{encode, encode_to_string, EncodeError};
