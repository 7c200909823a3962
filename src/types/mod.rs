//! Serialization primitives shared by the program image format.
//!
//! - `Encode`/`Decode`: little-endian binary codec traits
//! - `#[derive(BinaryCodec)]` (from `asmbot_derive`) implements both for structs and enums

pub mod encoding;
