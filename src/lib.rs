mod bandwidth;
pub mod calculator;
mod task;

pub use bandwidth::*;
pub use calculator::{
    Algorithm, AnyCalculator, BuildError, ParseConfigError, RepairRouter, RouteCalculator,
    RouteCalculatorBuilder, RouteConfig, SizingPolicy,
};
pub use task::*;
