//! # Compact integer encodings

pub mod prefix_varint;
