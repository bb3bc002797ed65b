//! Semantic analysis: signatures, type inference, function metrics, constant
//! folding, liveness and live intervals.

pub mod accessors;
pub mod analyzer;
pub mod consteval;
pub mod infer;
pub mod intervals;
pub mod liveness;

pub use analyzer::{AnalyzerState, FunctionMetrics};
pub use consteval::evaluate_constant_expression;
pub use intervals::LiveInterval;
