// src/core/mod.rs

pub mod context;
pub mod functions;
pub mod key;
pub mod scopes;
