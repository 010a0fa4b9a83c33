pub mod catalog;
pub mod edsm;
