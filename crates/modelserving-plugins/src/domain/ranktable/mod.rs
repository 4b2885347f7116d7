//! Rank table aggregation
//!
//! Turns per-pod accelerator annotations into one rendered rank table per
//! serving group or role instance:
//!
//! 1. [`template::TemplateResolver`] loads the user supplied templates
//! 2. [`readiness::ReadinessEvaluator`] decides whether the scope is complete
//!    and collects one [`types::PodRanktableData`] per pod through
//!    [`parser::PodParser`]
//! 3. [`aggregator::aggregate`] assigns dense rank ids
//! 4. [`renderer::Renderer`] produces the final JSON document

use core::error::Error;

pub mod aggregator;
pub mod engine;
pub mod parser;
pub mod readiness;
pub mod renderer;
pub mod template;
pub mod types;

pub use aggregator::aggregate;
pub use aggregator::FixedClock;
pub use aggregator::SystemClock;
pub use aggregator::TimeSource;
pub use engine::JinjaEngine;
pub use engine::TemplateEngine;
pub use parser::PodParser;
pub use readiness::Readiness;
pub use readiness::ReadinessEvaluator;
pub use renderer::Renderer;
pub use template::TemplateResolver;
pub use types::*;

/// Errors raised while resolving, parsing or rendering rank tables.
#[derive(Debug, derive_more::Display)]
pub enum RanktableError {
    #[display("Invalid rank table configuration: {message}")]
    Configuration { message: String },
    #[display("Template {name} not found in namespace {namespace}")]
    TemplateNotFound { namespace: String, name: String },
    #[display("Failed to evaluate template {name}")]
    Template { name: String },
    #[display("Failed to parse rank table annotation of pod {pod}")]
    Parse { pod: String },
    #[display("Failed to render rank table")]
    Render,
    #[display("Rendered rank table is not valid JSON: {content}")]
    InvalidOutput { content: String },
}

impl Error for RanktableError {}
