//! Workflow execution support: definitions, persisted contexts, and the
//! generic DAG engine.

pub mod context;
pub mod definition;
pub mod engine;

pub use context::{MetadataPatch, TaskErrorRecord, WorkflowContext, WorkflowMetadata};
pub use definition::{
    TaskContext, TaskDefinition, TaskHandler, TaskPayload, WorkflowDefinition,
};
pub use engine::WorkflowEngine;
