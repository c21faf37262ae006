pub mod backend;
pub mod config;
pub mod counter;
pub mod dataset;
pub mod error;
pub mod hash;
pub mod packet;
pub mod partition;
pub mod rx;
pub mod stats;
pub mod structs;
pub mod tx;

mod utils;

pub use error::{Error, Result};
