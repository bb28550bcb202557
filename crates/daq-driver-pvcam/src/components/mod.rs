//! Driver components shared by every camera implementation.

pub mod circ_buffer;
pub mod params;
