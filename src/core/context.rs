// src/core/context.rs

use crate::constants::{CYCLE_TRAIL_SEPARATOR, PRIVATE_KEY_PREFIX, TEMPLATE_OPEN};
use crate::core::functions::FunctionError;
use crate::core::key::{KeySegment, render_key_path, template_for_path};
use log::{debug, trace};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Fatal resolution failures. Lookup misses are *not* errors — they are
/// reported through [`ResolveOutput::message`] so that callers composing
/// conditional logic can still short-circuit.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Circular reference detected when resolving key '{path}' ({trail}).")]
    CircularReference { path: String, trail: String },
    #[error("{message}")]
    SelfReference { message: String },
    #[error("Helper Function Error: {0}")]
    HelperFunction(#[from] FunctionError),
}

pub type ContextResult<T> = Result<T, ContextError>;

/// Per-top-level-call resolution options.
///
/// The `stack` holds the fully-qualified rendered paths currently being
/// resolved. It is the single source of truth for cycle detection: each
/// descent yields a new effective stack for the recursive call, so unrelated
/// top-level calls never observe each other's in-flight paths.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Opt into deferral instead of failure for keys that cannot be resolved
    /// in this pass.
    pub allow_partial: bool,
    /// Fully-qualified paths currently being resolved.
    pub stack: Vec<String>,
}

impl ResolveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a pass that defers missing keys instead of failing.
    pub fn partial() -> Self {
        Self {
            allow_partial: true,
            stack: Vec::new(),
        }
    }

    fn contains(&self, entry: &str) -> bool {
        self.stack.iter().any(|e| e == entry)
    }

    fn trail(&self) -> String {
        self.stack.join(CYCLE_TRAIL_SEPARATOR)
    }

    /// Extends the stack for a boundary that must be duplicate-checked
    /// (callable resolvers, embedded template literals). A repeated entry is
    /// always a fatal circular reference.
    fn descend(&self, entry: &str) -> ContextResult<Self> {
        if self.contains(entry) {
            return Err(ContextError::CircularReference {
                path: entry.to_string(),
                trail: self.trail(),
            });
        }
        Ok(self.extend(entry))
    }

    /// Extends the stack without a duplicate check. Used at nested-context
    /// boundaries, where the nested node's own entry check guards the full
    /// path: the boundary prefix may legitimately repeat when sibling fields
    /// of the same scope reference each other.
    fn extend(&self, entry: &str) -> Self {
        let mut child = self.clone();
        child.stack.push(entry.to_string());
        child
    }
}

/// The result of one `resolve` call.
///
/// Exactly one of three shapes is produced: a final value (`resolved` set,
/// `partial` false), a deferral (`resolved` holds literal re-renderable
/// template text, `partial` true), or a miss (`resolved` empty, `message`
/// describing the failing segment and its available siblings).
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveOutput {
    pub resolved: Option<Value>,
    pub message: Option<String>,
    pub partial: bool,
}

impl ResolveOutput {
    pub fn found(value: Value) -> Self {
        Self {
            resolved: Some(value),
            message: None,
            partial: false,
        }
    }

    pub fn missing(message: String) -> Self {
        Self {
            resolved: None,
            message: Some(message),
            partial: false,
        }
    }

    /// A deferral: the key could not be resolved in this pass, so it is
    /// folded back into literal template text for a later one.
    pub fn deferred(template: String, message: Option<String>) -> Self {
        Self {
            resolved: Some(Value::String(template)),
            message,
            partial: true,
        }
    }

    /// Whether this output carries a final, non-deferred value.
    pub fn is_final(&self) -> bool {
        self.resolved.is_some() && !self.partial
    }
}

/// Re-enters the template evaluator on a string value that itself contains
/// `${...}` expressions. The evaluator is an external collaborator; the
/// engine hands it the resolution root and the current options so cycle
/// detection spans the re-entry.
pub trait TemplateEvaluator: Send + Sync {
    fn evaluate(
        &self,
        template: &str,
        root: &ContextNode,
        opts: &ResolveOptions,
    ) -> ContextResult<Value>;
}

/// A lazy sub-resolution function stored in a scope. It consumes the
/// remaining key segments and produces a full resolve output.
pub trait LazyResolver: Send + Sync {
    fn resolve(
        &self,
        key: &[KeySegment],
        path: &[KeySegment],
        root: &ContextNode,
        opts: &ResolveOptions,
    ) -> ContextResult<ResolveOutput>;
}

/// One field of a scope: plain data, a nested scope, or a lazy resolver.
pub enum ContextMember {
    Leaf(Value),
    Node(ContextNode),
    Resolver(Arc<dyn LazyResolver>),
}

impl fmt::Debug for ContextMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaf(value) => f.debug_tuple("Leaf").field(value).finish(),
            Self::Node(node) => f.debug_tuple("Node").field(node).finish(),
            Self::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

impl From<Value> for ContextMember {
    fn from(value: Value) -> Self {
        Self::Leaf(value)
    }
}

impl From<ContextNode> for ContextMember {
    fn from(node: ContextNode) -> Self {
        Self::Node(node)
    }
}

/// Declared shape of one scope field, consumed by the (external)
/// documentation and introspection layers. The engine exposes these tables
/// but never evaluates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSchema {
    pub name: &'static str,
    pub ty: &'static str,
    pub description: &'static str,
    pub example: &'static str,
}

/// The concrete kinds of context node. Dispatch during resolution is
/// explicit pattern matching over this union.
#[derive(Debug)]
pub enum NodeKind {
    /// A record of named fields, optionally delegating to an embedded, more
    /// general scope: a miss on own members falls back to it.
    Scope {
        members: BTreeMap<String, ContextMember>,
        fallback: Option<Box<ContextNode>>,
    },
    /// A dynamic named collection (per-module, per-provider, per-service
    /// sub-scopes). Diagnostics list the map's current key set.
    Map {
        entries: BTreeMap<String, ContextMember>,
    },
    /// Unconditionally fails with a fixed message. Used to produce specific
    /// diagnostics for disallowed self-references.
    ErrorSentinel { message: String },
    /// Never fails and never produces real data: every lookup is recorded
    /// and returned as a deferred literal. Used for static dependency
    /// extraction without real evaluation.
    Scan { found: Mutex<BTreeSet<String>> },
}

/// One named scope in the resolution tree.
///
/// Nodes are immutable after construction except for the lazy result cache
/// (and a scan node's found-key set), both behind a `Mutex` so trees stay
/// `Send + Sync` if a host shares them across threads. A tree is built fresh
/// for each resolution phase and discarded at the end of it.
pub struct ContextNode {
    kind: NodeKind,
    /// Sticky deferral flag: unresolved lookups under this node are never
    /// hard errors, regardless of `allow_partial`. Set at construction for
    /// scopes whose data is fundamentally unavailable in the current phase.
    always_defer: bool,
    /// External template evaluator, set on the resolution root. String
    /// values containing `${...}` are re-evaluated through it.
    evaluator: Option<Arc<dyn TemplateEvaluator>>,
    /// Static field schema for documentation generation.
    schema: &'static [FieldSchema],
    /// Locally-rendered key -> final resolved value. Only final results are
    /// ever written here; partial results are recomputed on the next pass.
    cache: Mutex<HashMap<String, Value>>,
}

impl fmt::Debug for ContextNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextNode")
            .field("kind", &self.kind)
            .field("always_defer", &self.always_defer)
            .finish_non_exhaustive()
    }
}

// --- CONSTRUCTION ---

impl ContextNode {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            always_defer: false,
            evaluator: None,
            schema: &[],
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// An empty record scope.
    pub fn scope() -> Self {
        Self::new(NodeKind::Scope {
            members: BTreeMap::new(),
            fallback: None,
        })
    }

    /// An empty map-like scope.
    pub fn map() -> Self {
        Self::new(NodeKind::Map {
            entries: BTreeMap::new(),
        })
    }

    /// A sentinel that fails every lookup with `message`.
    pub fn error_sentinel(message: impl Into<String>) -> Self {
        Self::new(NodeKind::ErrorSentinel {
            message: message.into(),
        })
    }

    /// A scan sentinel for static dependency extraction.
    pub fn scan() -> Self {
        Self::new(NodeKind::Scan {
            found: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn with_member(mut self, name: impl Into<String>, member: impl Into<ContextMember>) -> Self {
        let name = name.into();
        match &mut self.kind {
            NodeKind::Scope { members, .. } => {
                members.insert(name, member.into());
            }
            NodeKind::Map { entries } => {
                entries.insert(name, member.into());
            }
            NodeKind::ErrorSentinel { .. } | NodeKind::Scan { .. } => {
                debug!("Ignoring member '{name}' added to a sentinel node.");
            }
        }
        self
    }

    pub fn with_leaf(self, name: impl Into<String>, value: Value) -> Self {
        self.with_member(name, ContextMember::Leaf(value))
    }

    pub fn with_resolver(self, name: impl Into<String>, resolver: Arc<dyn LazyResolver>) -> Self {
        self.with_member(name, ContextMember::Resolver(resolver))
    }

    /// Embeds a more general scope: lookups that miss this node's own
    /// members fall back to it. This replaces inheritance chains with
    /// explicit composition.
    pub fn with_fallback(mut self, node: Self) -> Self {
        if let NodeKind::Scope { fallback, .. } = &mut self.kind {
            *fallback = Some(Box::new(node));
        }
        self
    }

    /// Marks this node as sticky-deferring.
    pub fn with_always_defer(mut self) -> Self {
        self.always_defer = true;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn TemplateEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_schema(mut self, schema: &'static [FieldSchema]) -> Self {
        self.schema = schema;
        self
    }
}

// --- INSPECTION ---

impl ContextNode {
    pub fn always_defers(&self) -> bool {
        self.always_defer
    }

    pub fn schema(&self) -> &'static [FieldSchema] {
        self.schema
    }

    /// The key set a lookup on this node would see, sorted, with private
    /// fields excluded. Delegating scopes include their fallback's keys.
    pub fn available_keys(&self) -> Vec<String> {
        let mut keys: BTreeSet<String> = BTreeSet::new();
        match &self.kind {
            NodeKind::Scope { members, fallback } => {
                keys.extend(members.keys().filter(|k| !is_private(k)).cloned());
                if let Some(fallback) = fallback {
                    keys.extend(fallback.available_keys());
                }
            }
            NodeKind::Map { entries } => {
                keys.extend(entries.keys().filter(|k| !is_private(k)).cloned());
            }
            NodeKind::ErrorSentinel { .. } | NodeKind::Scan { .. } => {}
        }
        keys.into_iter().collect()
    }

    /// The fully-qualified paths a scan node has recorded so far. Empty for
    /// every other node kind.
    pub fn found_keys(&self) -> BTreeSet<String> {
        match &self.kind {
            NodeKind::Scan { found } => found.lock().map(|f| f.clone()).unwrap_or_default(),
            _ => BTreeSet::new(),
        }
    }

    /// Looks up one named member, following the fallback chain of a
    /// delegating scope. Private-prefixed names are invisible.
    fn member(&self, name: &str) -> Option<&ContextMember> {
        if is_private(name) {
            return None;
        }
        match &self.kind {
            NodeKind::Scope { members, fallback } => members
                .get(name)
                .or_else(|| fallback.as_ref().and_then(|f| f.member(name))),
            NodeKind::Map { entries } => entries.get(name),
            NodeKind::ErrorSentinel { .. } | NodeKind::Scan { .. } => None,
        }
    }

    /// Renders this node as a plain JSON value, if it holds only data.
    /// Returns `None` as soon as a lazy resolver or sentinel is reached.
    /// Private-prefixed members are excluded.
    pub fn to_value(&self) -> Option<Value> {
        let entries = match &self.kind {
            NodeKind::Scope { members, fallback } => {
                let mut map = match fallback.as_ref() {
                    Some(fallback) => match fallback.to_value()? {
                        Value::Object(map) => map,
                        _ => return None,
                    },
                    None => serde_json::Map::new(),
                };
                for (name, member) in members {
                    if is_private(name) {
                        continue;
                    }
                    map.insert(name.clone(), member_to_value(member)?);
                }
                return Some(Value::Object(map));
            }
            NodeKind::Map { entries } => entries,
            NodeKind::ErrorSentinel { .. } | NodeKind::Scan { .. } => return None,
        };

        let mut map = serde_json::Map::new();
        for (name, member) in entries {
            if is_private(name) {
                continue;
            }
            map.insert(name.clone(), member_to_value(member)?);
        }
        Some(Value::Object(map))
    }
}

fn member_to_value(member: &ContextMember) -> Option<Value> {
    match member {
        ContextMember::Leaf(value) => Some(value.clone()),
        ContextMember::Node(node) => node.to_value(),
        ContextMember::Resolver(_) => None,
    }
}

fn is_private(name: &str) -> bool {
    name.starts_with(PRIVATE_KEY_PREFIX)
}

// --- RESOLUTION ---

/// Walk state: either still inside the scope tree, or already holding a
/// plain value that remaining segments index into.
enum Cursor<'a> {
    Node(&'a ContextNode),
    Value(Value),
}

impl ContextNode {
    /// Resolves `key` against this node, treating it as the resolution root.
    ///
    /// Lookup misses are reported in the output, not raised; only circular
    /// and self-references are fatal. See [`ResolveOutput`] for the three
    /// result shapes.
    pub fn resolve(
        &self,
        key: &[KeySegment],
        base_path: &[KeySegment],
        opts: &ResolveOptions,
    ) -> ContextResult<ResolveOutput> {
        self.resolve_from(self, key, base_path, opts)
    }

    /// Internal walker. `root` is the node the top-level call entered on; it
    /// is threaded through explicitly so embedded template strings can be
    /// re-evaluated from the top without nodes owning a back-pointer.
    fn resolve_from(
        &self,
        root: &Self,
        key: &[KeySegment],
        base_path: &[KeySegment],
        opts: &ResolveOptions,
    ) -> ContextResult<ResolveOutput> {
        // Sentinels bypass the walk entirely.
        match &self.kind {
            NodeKind::ErrorSentinel { message } => {
                return Err(ContextError::SelfReference {
                    message: message.clone(),
                });
            }
            NodeKind::Scan { found } => {
                let full: Vec<KeySegment> = base_path.iter().chain(key).cloned().collect();
                let rendered = render_key_path(&full);
                trace!("Scan node recorded key '{rendered}'.");
                if let Ok(mut found) = found.lock() {
                    found.insert(rendered);
                }
                return Ok(ResolveOutput::deferred(template_for_path(&full), None));
            }
            NodeKind::Scope { .. } | NodeKind::Map { .. } => {}
        }

        let local_path = render_key_path(key);
        let full_segments: Vec<KeySegment> = base_path.iter().chain(key).cloned().collect();
        let full_path = render_key_path(&full_segments);

        if opts.contains(&full_path) {
            return Err(ContextError::CircularReference {
                path: full_path,
                trail: opts.trail(),
            });
        }

        if let Ok(cache) = self.cache.lock()
            && let Some(hit) = cache.get(&local_path)
        {
            trace!("Cache hit for key '{local_path}'.");
            return Ok(ResolveOutput::found(hit.clone()));
        }

        let walked = self.walk(root, key, base_path, opts)?;

        let output = match walked {
            Walked::Done(value) => ResolveOutput::found(value),
            // An adopted miss from deeper in the tree still defers when this
            // node is sticky: the nearest flagged ancestor owns the deferral.
            Walked::Adopted(adopted)
                if adopted.resolved.is_none() && !adopted.partial && self.always_defer =>
            {
                debug!("Deferring unresolved key '{full_path}' (sticky scope).");
                ResolveOutput::deferred(template_for_path(&full_segments), adopted.message)
            }
            Walked::Adopted(adopted) => adopted,
            Walked::Missing { message } => {
                // Sticky flag first, then the caller's per-pass opt-in. Both
                // defer to the same re-renderable literal.
                if self.always_defer {
                    debug!("Deferring unresolved key '{full_path}' (sticky scope).");
                    ResolveOutput::deferred(template_for_path(&full_segments), Some(message))
                } else if opts.allow_partial {
                    debug!("Deferring unresolved key '{full_path}' (partial pass).");
                    ResolveOutput::deferred(template_for_path(&full_segments), Some(message))
                } else {
                    ResolveOutput::missing(message)
                }
            }
        };

        if output.is_final()
            && let (Some(value), Ok(mut cache)) = (output.resolved.as_ref(), self.cache.lock())
        {
            cache.insert(local_path, value.clone());
        }

        Ok(output)
    }

    /// Segment-by-segment walk. Iterative rather than per-segment recursive,
    /// so resolvers and nested scopes can consume a variable number of the
    /// remaining segments.
    fn walk(
        &self,
        root: &Self,
        key: &[KeySegment],
        base_path: &[KeySegment],
        opts: &ResolveOptions,
    ) -> ContextResult<Walked> {
        let mut cursor = Cursor::Node(self);

        for (p, segment) in key.iter().enumerate() {
            let remainder = key.get(p + 1..).unwrap_or_default();
            let nested_path: Vec<KeySegment> = base_path
                .iter()
                .chain(key.iter().take(p + 1))
                .cloned()
                .collect();
            let parent_path: Vec<KeySegment> =
                base_path.iter().chain(key.iter().take(p)).cloned().collect();

            if segment.is_private() {
                return Ok(Walked::Missing {
                    message: not_found_message(segment, &parent_path, cursor_keys(&cursor)),
                });
            }

            let next = match &cursor {
                Cursor::Node(node) => {
                    let Some(name) = segment.as_name() else {
                        return Ok(Walked::Missing {
                            message: format!(
                                "Cannot index into scope '{}' with '{segment}'; scopes are keyed by name.",
                                render_key_path(&parent_path),
                            ),
                        });
                    };
                    match node.member(name) {
                        Some(ContextMember::Resolver(resolver)) => {
                            let entry = render_key_path(&nested_path);
                            let child_opts = opts.descend(&entry)?;
                            trace!("Invoking lazy resolver at '{entry}'.");
                            let resolver = Arc::clone(resolver);
                            let out =
                                resolver.resolve(remainder, &nested_path, root, &child_opts)?;
                            return Ok(Walked::Adopted(out));
                        }
                        Some(ContextMember::Node(nested)) => {
                            if remainder.is_empty() {
                                match nested.to_value() {
                                    Some(value) => Some(value),
                                    None => {
                                        return Ok(Walked::Missing {
                                            message: format!(
                                                "Key '{}' resolves to a scope and cannot be used as a value here.",
                                                render_key_path(&nested_path),
                                            ),
                                        });
                                    }
                                }
                            } else {
                                // The nested node owns the rest of the path.
                                let child_opts = opts.extend(&render_key_path(&nested_path));
                                let out = nested.resolve_from(
                                    root,
                                    remainder,
                                    &nested_path,
                                    &child_opts,
                                )?;
                                return Ok(Walked::Adopted(out));
                            }
                        }
                        Some(ContextMember::Leaf(value)) => Some(value.clone()),
                        None => None,
                    }
                }
                Cursor::Value(value) => match value {
                    Value::Object(map) => match segment.as_name() {
                        Some(name) if !is_private(name) => map.get(name).cloned(),
                        _ => None,
                    },
                    Value::Array(items) => match segment {
                        KeySegment::Index(index) => items.get(*index).cloned(),
                        KeySegment::Name(_) => {
                            return Ok(Walked::Missing {
                                message: format!(
                                    "Attempted to look up key '{segment}' on an array at '{}'; use an index instead.",
                                    render_key_path(&parent_path),
                                ),
                            });
                        }
                    },
                    _ => {
                        return Ok(Walked::Missing {
                            message: format!(
                                "Attempted to look up key '{segment}' on a primitive value at '{}'.",
                                render_key_path(&parent_path),
                            ),
                        });
                    }
                },
            };

            let Some(mut next) = next else {
                return Ok(Walked::Missing {
                    message: not_found_message(segment, &parent_path, cursor_keys(&cursor)),
                });
            };

            // A string value may itself contain template syntax; re-enter
            // the top-level evaluator on it before walking further.
            if let Value::String(text) = &next
                && text.contains(TEMPLATE_OPEN)
                && let Some(evaluator) = root.evaluator.as_ref()
            {
                let text = text.clone();
                let entry = render_key_path(&nested_path);
                let child_opts = opts.descend(&entry)?;
                trace!("Re-evaluating embedded template at '{entry}'.");
                next = evaluator.evaluate(&text, root, &child_opts)?;
            }

            cursor = Cursor::Value(next);
        }

        match cursor {
            Cursor::Value(value) => Ok(Walked::Done(value)),
            // An empty key addresses the scope itself.
            Cursor::Node(node) => match node.to_value() {
                Some(value) => Ok(Walked::Done(value)),
                None => Ok(Walked::Missing {
                    message: format!(
                        "Key '{}' resolves to a scope and cannot be used as a value here.",
                        render_key_path(base_path),
                    ),
                }),
            },
        }
    }
}

/// Outcome of one walk, before deferral policy is applied.
enum Walked {
    /// The walk consumed every segment and produced a value.
    Done(Value),
    /// A resolver or nested scope consumed the remainder; its output is
    /// adopted as-is.
    Adopted(ResolveOutput),
    /// A segment could not be found.
    Missing { message: String },
}

fn cursor_keys(cursor: &Cursor<'_>) -> Option<Vec<String>> {
    match cursor {
        Cursor::Node(node) => Some(node.available_keys()),
        Cursor::Value(Value::Object(map)) => {
            Some(map.keys().filter(|k| !is_private(k)).cloned().collect())
        }
        Cursor::Value(_) => None,
    }
}

/// Builds the diagnostic for a missing key: the failing segment, the path it
/// was looked up under, and the sorted sibling key set when one is known.
fn not_found_message(
    segment: &KeySegment,
    parent_path: &[KeySegment],
    siblings: Option<Vec<String>>,
) -> String {
    let mut message = if parent_path.is_empty() {
        format!("Could not find key '{segment}'.")
    } else {
        format!(
            "Could not find key '{segment}' under '{}'.",
            render_key_path(parent_path)
        )
    };

    if let Some(mut keys) = siblings
        && !keys.is_empty()
    {
        keys.sort();
        message.push_str(&format!(" Available keys: {}.", keys.join(", ")));
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::{ContextKey, parse_key_path};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(path: &str) -> ContextKey {
        parse_key_path(path).unwrap()
    }

    fn project_scope() -> ContextNode {
        ContextNode::scope().with_member(
            "project",
            ContextNode::scope()
                .with_leaf("name", json!("my-project"))
                .with_leaf("id", json!("proj-1234"))
                .with_leaf("_internal", json!("hidden")),
        )
    }

    #[test]
    fn test_resolves_simple_key() {
        let root = project_scope();
        let out = root
            .resolve(&key("project.name"), &[], &ResolveOptions::new())
            .unwrap();
        assert_eq!(out.resolved, Some(json!("my-project")));
        assert!(!out.partial);
        assert_eq!(out.message, None);
    }

    #[test]
    fn test_missing_key_reports_sorted_available_keys() {
        let root = project_scope();
        let out = root
            .resolve(&key("project.missingField"), &[], &ResolveOptions::new())
            .unwrap();
        assert_eq!(out.resolved, None);
        let message = out.message.unwrap();
        assert!(
            message.contains("Available keys: id, name."),
            "unexpected message: {message}"
        );
    }

    #[test]
    fn test_private_fields_are_invisible() {
        let root = project_scope();
        let out = root
            .resolve(&key("project._internal"), &[], &ResolveOptions::new())
            .unwrap();
        assert_eq!(out.resolved, None);
        // The sibling list must not leak the private field.
        let message = out.message.unwrap();
        assert!(
            message.contains("Available keys: id, name."),
            "unexpected message: {message}"
        );
    }

    #[test]
    fn test_primitive_lookup_fails_with_message() {
        let root = project_scope();
        let out = root
            .resolve(&key("project.name.nested"), &[], &ResolveOptions::new())
            .unwrap();
        assert_eq!(out.resolved, None);
        assert!(out.message.unwrap().contains("on a primitive value"));
    }

    #[test]
    fn test_array_index_lookup() {
        let root = ContextNode::scope().with_leaf("items", json!(["a", "b", "c"]));
        let out = root
            .resolve(&key("items[1]"), &[], &ResolveOptions::new())
            .unwrap();
        assert_eq!(out.resolved, Some(json!("b")));

        let by_name = root
            .resolve(&key("items.first"), &[], &ResolveOptions::new())
            .unwrap();
        assert!(by_name.message.unwrap().contains("use an index instead"));
    }

    #[test]
    fn test_delegating_scope_falls_back_and_shadows() {
        let base = ContextNode::scope()
            .with_leaf("shared", json!("from-base"))
            .with_leaf("only_base", json!("base-value"));
        let derived = ContextNode::scope()
            .with_leaf("shared", json!("from-derived"))
            .with_fallback(base);

        let opts = ResolveOptions::new();
        let shadowed = derived.resolve(&key("shared"), &[], &opts).unwrap();
        assert_eq!(shadowed.resolved, Some(json!("from-derived")));

        let inherited = derived.resolve(&key("only_base"), &[], &opts).unwrap();
        assert_eq!(inherited.resolved, Some(json!("base-value")));
    }

    struct CountingResolver {
        calls: AtomicUsize,
        value: Value,
    }

    impl LazyResolver for CountingResolver {
        fn resolve(
            &self,
            _key: &[KeySegment],
            _path: &[KeySegment],
            _root: &ContextNode,
            _opts: &ResolveOptions,
        ) -> ContextResult<ResolveOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResolveOutput::found(self.value.clone()))
        }
    }

    #[test]
    fn test_cache_prevents_rewalking() {
        let counter = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            value: json!("computed"),
        });
        let counting = Arc::clone(&counter) as Arc<dyn LazyResolver>;
        let root = ContextNode::scope().with_resolver("lazy", counting);

        let opts = ResolveOptions::new();
        let first = root.resolve(&key("lazy"), &[], &opts).unwrap();
        let second = root.resolve(&key("lazy"), &[], &opts).unwrap();

        assert_eq!(first, second);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_partial_results_are_not_cached() {
        let deferring = ContextNode::scope().with_member(
            "runtime",
            ContextNode::scope().with_always_defer(),
        );

        let opts = ResolveOptions::partial();
        let first = deferring.resolve(&key("runtime.url"), &[], &opts).unwrap();
        assert!(first.partial);

        // The second pass must re-walk; a cached partial would now be stale.
        let second = deferring.resolve(&key("runtime.url"), &[], &opts).unwrap();
        assert!(second.partial);
        assert_eq!(first.resolved, second.resolved);
    }

    struct ChainResolver {
        target: ContextKey,
    }

    impl LazyResolver for ChainResolver {
        fn resolve(
            &self,
            _key: &[KeySegment],
            _path: &[KeySegment],
            root: &ContextNode,
            opts: &ResolveOptions,
        ) -> ContextResult<ResolveOutput> {
            root.resolve(&self.target, &[], opts)
        }
    }

    #[test]
    fn test_mutual_resolvers_trigger_circular_reference() {
        let root = ContextNode::scope()
            .with_resolver("a", Arc::new(ChainResolver { target: key("b") }))
            .with_resolver("b", Arc::new(ChainResolver { target: key("a") }));

        let err = root
            .resolve(&key("a"), &[], &ResolveOptions::new())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Circular reference"), "{message}");
        assert!(message.contains("a"), "{message}");
        assert!(message.contains("b"), "{message}");
    }

    #[test]
    fn test_sticky_deferral_returns_literal_template() {
        let root = ContextNode::scope().with_member(
            "runtime",
            ContextNode::scope().with_always_defer().with_member(
                "services",
                ContextNode::map(),
            ),
        );

        let out = root
            .resolve(
                &key("runtime.services.web.outputs.url"),
                &[],
                &ResolveOptions::partial(),
            )
            .unwrap();
        assert_eq!(
            out.resolved,
            Some(json!("${runtime.services.web.outputs.url}"))
        );
        assert!(out.partial);
    }

    #[test]
    fn test_sticky_deferral_wins_over_disallowed_partial() {
        // Sticky scopes defer even when the caller did not opt into partial
        // resolution; their data is fundamentally unavailable this phase.
        let root = ContextNode::scope()
            .with_member("runtime", ContextNode::scope().with_always_defer());

        let out = root
            .resolve(&key("runtime.services.web"), &[], &ResolveOptions::new())
            .unwrap();
        assert_eq!(out.resolved, Some(json!("${runtime.services.web}")));
        assert!(out.partial);
    }

    #[test]
    fn test_allow_partial_defers_ordinary_misses() {
        let root = project_scope();
        let out = root
            .resolve(&key("project.missingField"), &[], &ResolveOptions::partial())
            .unwrap();
        assert_eq!(out.resolved, Some(json!("${project.missingField}")));
        assert!(out.partial);
        assert!(out.message.is_some());
    }

    #[test]
    fn test_error_sentinel_is_always_fatal() {
        let root = ContextNode::scope().with_member(
            "modules",
            ContextNode::map().with_member(
                "foo",
                ContextNode::error_sentinel("Module 'foo' cannot reference itself."),
            ),
        );

        // Fatal even under a partial pass.
        let err = root
            .resolve(&key("modules.foo.outputs.x"), &[], &ResolveOptions::partial())
            .unwrap_err();
        assert!(err.to_string().contains("cannot reference itself."));
    }

    #[test]
    fn test_scan_node_records_and_defers() {
        let scan = ContextNode::scan();
        let root = ContextNode::scope().with_member("var", scan);

        let opts = ResolveOptions::new();
        let out = root.resolve(&key("var.region"), &[], &opts).unwrap();
        assert_eq!(out.resolved, Some(json!("${var.region}")));
        assert!(out.partial);

        root.resolve(&key("var.zone[0]"), &[], &opts).unwrap();

        // The scan node itself holds the found set.
        let NodeKind::Scope { members, .. } = &root.kind else {
            panic!("expected scope")
        };
        let Some(ContextMember::Node(scan)) = members.get("var") else {
            panic!("expected node member")
        };
        let found: Vec<String> = scan.found_keys().into_iter().collect();
        assert_eq!(found, vec!["var.region", "var.zone[0]"]);
    }

    struct LookupEvaluator;

    impl TemplateEvaluator for LookupEvaluator {
        fn evaluate(
            &self,
            template: &str,
            root: &ContextNode,
            opts: &ResolveOptions,
        ) -> ContextResult<Value> {
            // A stand-in for the real template parser: resolve the inner
            // key path and return its value.
            let inner = template
                .trim_start_matches("${")
                .trim_end_matches('}')
                .to_string();
            let out = root.resolve(&key(&inner), &[], opts)?;
            Ok(out.resolved.unwrap_or(Value::Null))
        }
    }

    #[test]
    fn test_embedded_template_is_reevaluated_from_root() {
        let root = ContextNode::scope()
            .with_member(
                "var",
                ContextNode::scope()
                    .with_leaf("region", json!("eu-west-1"))
                    .with_leaf("bucket", json!("${var.region}")),
            )
            .with_evaluator(Arc::new(LookupEvaluator));

        let out = root
            .resolve(&key("var.bucket"), &[], &ResolveOptions::new())
            .unwrap();
        assert_eq!(out.resolved, Some(json!("eu-west-1")));
    }

    #[test]
    fn test_self_referencing_template_is_circular() {
        let root = ContextNode::scope()
            .with_member(
                "var",
                ContextNode::scope().with_leaf("a", json!("${var.a}")),
            )
            .with_evaluator(Arc::new(LookupEvaluator));

        let err = root
            .resolve(&key("var.a"), &[], &ResolveOptions::new())
            .unwrap_err();
        assert!(err.to_string().contains("Circular reference"));
    }

    #[test]
    fn test_scope_materializes_to_plain_value() {
        let root = project_scope();
        let out = root
            .resolve(&key("project"), &[], &ResolveOptions::new())
            .unwrap();
        // Private members are excluded from the rendered object.
        assert_eq!(
            out.resolved,
            Some(json!({"name": "my-project", "id": "proj-1234"}))
        );
    }

    #[test]
    fn test_unrelated_calls_do_not_share_stacks() {
        let root = ContextNode::scope()
            .with_resolver("a", Arc::new(ChainResolver { target: key("b") }))
            .with_leaf("b", json!(1));

        let opts = ResolveOptions::new();
        assert!(root.resolve(&key("a"), &[], &opts).is_ok());
        // A fresh top-level call over the same path must start clean.
        assert!(root.resolve(&key("a"), &[], &opts).is_ok());
    }
}
