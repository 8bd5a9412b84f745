// fleetgate library - fleet coordination core
// Exposes the coordinator, supervisor, merge gate and retention engine for the binary and tests

pub mod cli;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod gate;
pub mod http;
pub mod observability;
pub mod retention;
pub mod shutdown;
pub mod supervisor;
pub mod telemetry;
pub mod types;

// Re-export key types for easy access
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FleetConfig;
pub use coordinator::{AlertSink, AlertSource, Coordinator, DashboardSummary, HealthProbe, SweepReport};
pub use errors::{FleetError, Result};
pub use gate::{decide, AlertSignal, GateDecision, GateOutcome, GatePolicy, MergeGate};
pub use http::{build_router, AppState, CoordinatorClient};
pub use observability::{FleetMetrics, FleetStats, OperationTimer};
pub use retention::{RetentionEngine, TriggerDecision};
pub use shutdown::ShutdownCoordinator;
pub use supervisor::{Supervisor, WorkerState, WorkerStatus};
pub use telemetry::{create_coordination_span, generate_correlation_id, init_cli_telemetry, init_telemetry};
pub use types::*;
