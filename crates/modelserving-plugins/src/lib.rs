pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod plugins;

// Re-export main modules
pub use domain::ranktable;
pub use domain::reconciler;
pub use infrastructure::store;
