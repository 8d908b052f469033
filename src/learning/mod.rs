pub mod adaptive;

pub use adaptive::{
    AdaptiveThresholdController, ExecutionMode, ExecutionRecord, ThresholdAdjustment,
    ThresholdMetrics, ThresholdState,
};
