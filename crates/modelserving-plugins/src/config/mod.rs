pub mod cli;
pub mod cluster;
pub mod offline;

pub use cli::*;
pub use cluster::*;
pub use offline::*;
