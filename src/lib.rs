#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod blur;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod device;
pub mod error;
pub mod labels;
pub mod mask;
pub mod model;
pub mod pipeline;
pub mod shuffle;
pub mod training;
pub mod visualize;

pub use error::ReprogramError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
