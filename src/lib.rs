//! Context resolution engine for templated infrastructure configuration.
//!
//! Configuration documents reference values through `${...}` expressions
//! evaluated against a tree of scopes (project, environment, providers,
//! modules, runtime outputs, workflow steps). This crate owns the key-path
//! resolution behind those expressions: walking the scope tree, detecting
//! cycles, deferring not-yet-available data across passes, memoizing final
//! results, and dispatching the helper functions callable from templates.
//! The template grammar itself, file loaders, and the CLI live elsewhere.

pub mod constants;
pub mod core;
pub mod models;
