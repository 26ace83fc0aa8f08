//! Shared utility modules used across Xiphos components.

pub mod varint;
