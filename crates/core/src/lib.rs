//! Multi-agent orchestration core: agent pool, capability matcher,
//! coordinator, workflow state manager, and the workflow engine façade
//! that ties them together (spec §1, §2).
//!
//! Every singleton an embedding application would otherwise reach for
//! globally — wall-clock time, id generation, the event bus, the agent
//! registry — is constructed explicitly and passed in, so a whole engine
//! can be stood up deterministically in a test (spec §8, §9).

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod model;
pub mod registry;
pub mod state_manager;
pub mod state_store;

pub use clock::{Clock, FixedClock, IdGenerator, SequentialGenerator, SystemClock, UuidGenerator};
pub use config::EngineConfig;
pub use coordinator::{AgentExecutor, CancellationToken, Coordinator, CoordinatorDeps, InvokeContext, TaskEnvelope};
pub use engine::{EngineDeps, WorkflowEngine};
pub use error::{Error, ErrorKind, Result};
pub use event_bus::{topics, Event, EventBus, EventSubscription, RecvOutcome, TopicFilter};
pub use model::{
    AdaptiveParams, AdaptiveRule, Aggregation, Assignment, AssignmentOutcome, BackoffPolicy,
    ConsensusParams, ExecutionPhase, ExecutionState, HierarchicalParams, OnFailure, ParallelParams,
    PartitionStrategy, PipelineParams, RetryPolicy, ScatterGatherParams, SequentialParams,
    StepDefinition, StepKind, StepMetrics, StepState, StepStatus, StructuredError,
    WorkflowDefinition,
};
pub use registry::{
    AgentDescriptor, AgentRegistry, AgentRuntime, AgentSnapshot, AgentStatus, CapabilityMatcher,
    CapabilityRequirement, HealthThresholds, HeartbeatSample, MatchStrategy, MatcherWeights,
    ResourceLimits,
};
pub use state_manager::{
    migrate, Checkpoint, CheckpointLevel, Checkpointer, SchemaMigration, StateManager,
    CURRENT_SCHEMA_VERSION, KNOWN_MIGRATIONS,
};
pub use state_store::{InMemoryStateStore, StateStore, VersionedValue};
