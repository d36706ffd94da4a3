// src/models.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// --- PROJECT & ENVIRONMENT MODELS ---
// These are what the (out-of-scope) file loaders deserialize configuration
// documents into before a scope tree is built for a resolution phase.

/// Project-level data known as soon as the project configuration is loaded.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ProjectData {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub vars: HashMap<String, Value>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// One configured environment of a project.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct EnvironmentData {
    pub name: String,
    /// Environment variables shadow project variables of the same name.
    #[serde(default)]
    pub vars: HashMap<String, Value>,
}

/// A configured provider, available once providers have been initialized.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ProviderData {
    pub name: String,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
}

/// A configured module, available once the dependency graph is known.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ModuleData {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub vars: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
}

// --- RUNTIME MODELS ---

/// Outputs of one deployed service.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ServiceRuntime {
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
}

/// Outputs of one executed task.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TaskRuntime {
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
}

/// Runtime outputs collected during a command. Absent entirely before
/// anything has executed; the runtime scope defers lookups in that case.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RuntimeData {
    #[serde(default)]
    pub services: HashMap<String, ServiceRuntime>,
    #[serde(default)]
    pub tasks: HashMap<String, TaskRuntime>,
}

// --- WORKFLOW MODELS ---

/// Result of one completed workflow step.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct WorkflowStepData {
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub log: String,
}
