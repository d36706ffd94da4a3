// src/core/scopes.rs

use crate::core::context::{ContextNode, FieldSchema};
use crate::models::{
    EnvironmentData, ModuleData, ProjectData, ProviderData, RuntimeData, WorkflowStepData,
};
use serde_json::Value;
use std::collections::HashMap;

// --- FIELD SCHEMAS ---
// Static declarations consumed by the external documentation/introspection
// layer. The engine exposes them per scope but never evaluates them.

pub static PROJECT_SCHEMA: &[FieldSchema] = &[
    FieldSchema {
        name: "project.name",
        ty: "string",
        description: "The name of the project.",
        example: "my-project",
    },
    FieldSchema {
        name: "project.id",
        ty: "string",
        description: "The unique ID of the project.",
        example: "proj-0fbe6a8c",
    },
    FieldSchema {
        name: "var.*",
        ty: "any",
        description: "Project-level variables, keyed by name.",
        example: "${var.region}",
    },
    FieldSchema {
        name: "secrets.*",
        ty: "string",
        description: "Project secrets, keyed by name.",
        example: "${secrets.api-token}",
    },
];

pub static ENVIRONMENT_SCHEMA: &[FieldSchema] = &[FieldSchema {
    name: "environment.name",
    ty: "string",
    description: "The name of the environment being operated on.",
    example: "dev",
}];

pub static PROVIDER_SCHEMA: &[FieldSchema] = &[
    FieldSchema {
        name: "providers.<name>.config",
        ty: "object",
        description: "The resolved configuration of the named provider.",
        example: "${providers.kubernetes.config.namespace}",
    },
    FieldSchema {
        name: "providers.<name>.outputs",
        ty: "object",
        description: "Outputs exposed by the named provider after initialization.",
        example: "${providers.kubernetes.outputs.cluster-ip}",
    },
];

pub static MODULE_SCHEMA: &[FieldSchema] = &[
    FieldSchema {
        name: "modules.<name>.path",
        ty: "string",
        description: "The source path of the named module.",
        example: "${modules.api.path}",
    },
    FieldSchema {
        name: "modules.<name>.vars",
        ty: "object",
        description: "The resolved variables of the named module.",
        example: "${modules.api.vars.replicas}",
    },
    FieldSchema {
        name: "modules.<name>.outputs",
        ty: "object",
        description: "Outputs of the named module after it has been built.",
        example: "${modules.api.outputs.image-id}",
    },
];

pub static RUNTIME_SCHEMA: &[FieldSchema] = &[
    FieldSchema {
        name: "runtime.services.<name>.outputs",
        ty: "object",
        description: "Outputs of the named deployed service. Deferred until runtime data exists.",
        example: "${runtime.services.web.outputs.url}",
    },
    FieldSchema {
        name: "runtime.tasks.<name>.outputs",
        ty: "object",
        description: "Outputs of the named executed task. Deferred until runtime data exists.",
        example: "${runtime.tasks.migrate.outputs.row-count}",
    },
];

pub static WORKFLOW_SCHEMA: &[FieldSchema] = &[
    FieldSchema {
        name: "steps.<name>.outputs",
        ty: "object",
        description: "Outputs of the named completed workflow step.",
        example: "${steps.build.outputs.artifact}",
    },
    FieldSchema {
        name: "steps.<name>.log",
        ty: "string",
        description: "The captured log of the named completed workflow step.",
        example: "${steps.build.log}",
    },
];

// --- SCOPE CONSTRUCTORS ---
// One constructor per resolution phase; later phases embed earlier ones by
// composition, so a lookup that misses the phase's own fields falls back to
// the more general scope.

fn map_of(values: &HashMap<String, Value>) -> ContextNode {
    let mut node = ContextNode::map();
    for (name, value) in values {
        node = node.with_leaf(name.clone(), value.clone());
    }
    node
}

fn string_map_of(values: &HashMap<String, String>) -> ContextNode {
    let mut node = ContextNode::map();
    for (name, value) in values {
        node = node.with_leaf(name.clone(), Value::String(value.clone()));
    }
    node
}

/// The scope available as soon as the project configuration is loaded:
/// `project.*`, `var.*` and `secrets.*`.
pub fn project_context(project: &ProjectData) -> ContextNode {
    ContextNode::scope()
        .with_schema(PROJECT_SCHEMA)
        .with_member(
            "project",
            ContextNode::scope()
                .with_leaf("name", Value::String(project.name.clone()))
                .with_leaf("id", Value::String(project.id.clone())),
        )
        .with_member("var", map_of(&project.vars))
        .with_member("secrets", string_map_of(&project.secrets))
}

/// The project scope plus `environment.*`; environment variables shadow
/// project variables of the same name.
pub fn environment_context(project: &ProjectData, environment: &EnvironmentData) -> ContextNode {
    let mut vars = project.vars.clone();
    vars.extend(
        environment
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    ContextNode::scope()
        .with_schema(ENVIRONMENT_SCHEMA)
        .with_member(
            "environment",
            ContextNode::scope().with_leaf("name", Value::String(environment.name.clone())),
        )
        .with_member("var", map_of(&vars))
        .with_fallback(project_context(project))
}

/// The environment scope plus `providers.<name>.{config,outputs}`.
pub fn provider_context(
    project: &ProjectData,
    environment: &EnvironmentData,
    providers: &[ProviderData],
) -> ContextNode {
    let mut provider_map = ContextNode::map();
    for provider in providers {
        provider_map = provider_map.with_member(
            provider.name.clone(),
            ContextNode::scope()
                .with_member("config", map_of(&provider.config))
                .with_member("outputs", map_of(&provider.outputs)),
        );
    }

    ContextNode::scope()
        .with_schema(PROVIDER_SCHEMA)
        .with_member("providers", provider_map)
        .with_fallback(environment_context(project, environment))
}

/// The provider scope plus `modules.<name>.*` and the sticky-deferring
/// `runtime` scope.
///
/// `current_module` names the module whose configuration is being resolved;
/// its own entry is an error sentinel so self-references produce a specific
/// diagnostic instead of a cycle trace.
pub fn module_context(
    project: &ProjectData,
    environment: &EnvironmentData,
    providers: &[ProviderData],
    modules: &[ModuleData],
    current_module: Option<&str>,
    runtime: Option<&RuntimeData>,
) -> ContextNode {
    let mut module_map = ContextNode::map();
    for module in modules {
        if current_module == Some(module.name.as_str()) {
            module_map = module_map.with_member(
                module.name.clone(),
                ContextNode::error_sentinel(format!(
                    "Module '{}' cannot reference itself.",
                    module.name
                )),
            );
            continue;
        }

        let mut scope = ContextNode::scope()
            .with_member("vars", map_of(&module.vars))
            .with_member("outputs", map_of(&module.outputs));
        if let Some(path) = &module.path {
            scope = scope.with_leaf("path", Value::String(path.clone()));
        }
        module_map = module_map.with_member(module.name.clone(), scope);
    }

    ContextNode::scope()
        .with_schema(MODULE_SCHEMA)
        .with_member("modules", module_map)
        .with_member("runtime", runtime_context(runtime))
        .with_fallback(provider_context(project, environment, providers))
}

/// The runtime-outputs scope. Before any runtime data exists its data is
/// fundamentally unavailable, so the node is sticky-deferring: unresolved
/// lookups fold back into literal template text instead of failing.
pub fn runtime_context(runtime: Option<&RuntimeData>) -> ContextNode {
    let mut services = ContextNode::map();
    let mut tasks = ContextNode::map();

    if let Some(runtime) = runtime {
        for (name, service) in &runtime.services {
            services = services.with_member(
                name.clone(),
                ContextNode::scope().with_member("outputs", map_of(&service.outputs)),
            );
        }
        for (name, task) in &runtime.tasks {
            tasks = tasks.with_member(
                name.clone(),
                ContextNode::scope().with_member("outputs", map_of(&task.outputs)),
            );
        }
    }

    ContextNode::scope()
        .with_schema(RUNTIME_SCHEMA)
        .with_member("services", services)
        .with_member("tasks", tasks)
        .with_always_defer()
}

/// The scope for workflow step configuration: `steps.<name>.{outputs,log}`
/// for completed steps, with a self-reference sentinel for the current step.
pub fn workflow_context(
    project: &ProjectData,
    environment: &EnvironmentData,
    steps: &HashMap<String, WorkflowStepData>,
    current_step: &str,
) -> ContextNode {
    let mut step_map = ContextNode::map();
    for (name, step) in steps {
        step_map = step_map.with_member(
            name.clone(),
            ContextNode::scope()
                .with_member("outputs", map_of(&step.outputs))
                .with_leaf("log", Value::String(step.log.clone())),
        );
    }
    step_map = step_map.with_member(
        current_step.to_string(),
        ContextNode::error_sentinel(format!("Step '{current_step}' cannot reference itself.")),
    );

    ContextNode::scope()
        .with_schema(WORKFLOW_SCHEMA)
        .with_member("steps", step_map)
        .with_fallback(environment_context(project, environment))
}
