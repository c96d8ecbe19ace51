//! Status map: data model, merge rules and wire codec.

pub mod codec;
pub mod map;
