pub mod archive;
pub mod config;
pub mod controller;
pub mod error;
pub mod outputs;
pub mod retry;
pub mod round;
pub mod runner;
pub mod store;
pub mod variant;

pub use error::{Error, Result};
