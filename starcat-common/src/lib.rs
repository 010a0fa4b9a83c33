///! Types shared by every starcat consumer: positions, catalog rows and the
///! EDSM / EDDB dump record layouts.

pub mod types;

pub use types::*;
