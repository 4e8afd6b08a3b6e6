// Order execution: placement, slippage control and position tracking
pub mod order_manager;
pub mod position_book;
pub mod slippage;

pub use order_manager::{ExecutionReport, OrderManager, OrderManagerConfig, OrderValidation};
pub use position_book::{ExitReason, ExitSignal, Position, PositionBook, PositionStatus};
pub use slippage::{
    ExecutionAnalytics, SlippageAnalysis, SlippageConfig, SlippageDistribution, SlippageHandler,
    SlippageMethod,
};
