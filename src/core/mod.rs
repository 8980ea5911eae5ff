pub mod catalog;
pub mod download;
pub mod gate;
pub mod model;
pub mod mount;
pub mod staging;
