pub mod config;
pub mod diff;
pub mod executor;
pub mod mds;
pub mod reconcile;
pub mod report;
pub mod topology;

pub use config::{ConfigError, ExecutorConfig, MdsConfig, RetryPolicy, ToolConfig, ToolOp};
pub use diff::{diff, ChangeSet, Operation, OperationKind, PoolDrift};
pub use executor::Executor;
pub use mds::{HttpTransport, MdsClient, MdsError, MdsTransport, MemoryMds};
pub use reconcile::{Phase, Reconciler};
pub use report::{
    OperationOutcome, OperationResult, ReconciliationReport, ReportStatus, RunState, SkipReason,
};
pub use topology::{
    parse_document, DesiredState, EntityKey, LiveState, ParseOptions, TopologyDocument,
    TopologyGraph, ValidationError,
};
