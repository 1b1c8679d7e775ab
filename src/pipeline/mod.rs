//! Pre-simulation data pipeline
//!
//! Three stages run before the bar loop starts and produce immutable
//! outputs: indicator pre-calculation, resampling onto the simulation grid,
//! and sub-bar expansion with the value-factor pre-calculation for dynamic
//! stops.

pub mod precalc;
pub mod resample;
pub mod subbar;

pub use precalc::{
    IndicatorEvaluator, IndicatorFactory, IndicatorPoint, IndicatorSeries, PointRequirements,
    PrecalcOutput, TaIndicatorFactory,
};
pub use resample::{
    standard_bucket, ResampledSignals, SimulationGrid, MIN_SIMULATION_RESOLUTION,
    STANDARD_BUCKETS,
};
pub use subbar::{synthesize_sub_bars, SyntheticSubBarProvider, ValueFactorSeries};
