// src/constants.rs

/// Prefix marking a scope field as private. Private fields are invisible to
/// lookup and excluded from "available keys" diagnostics.
pub const PRIVATE_KEY_PREFIX: char = '_';

/// Opening delimiter of a template expression.
pub const TEMPLATE_OPEN: &str = "${";

/// Closing delimiter of a template expression.
pub const TEMPLATE_CLOSE: &str = "}";

/// Separator used when rendering a cycle trail in diagnostics.
pub const CYCLE_TRAIL_SEPARATOR: &str = " -> ";
