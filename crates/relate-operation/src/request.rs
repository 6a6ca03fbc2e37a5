//! Dependency-tracked requests shared by all processors of one operation.
//!
//! Every pending unit of work (save an instance, delete an instance, a bulk
//! property update, a criteria delete) is a node in one [`RequestGraph`].
//! Processors keep their own payload keyed by [`RequestId`]; the graph only
//! knows about execution status and dependency edges.

use relate_core::{DependencyError, Error, Result};
use std::collections::BTreeSet;
use std::fmt;

/// Handle to a request in the graph. Ids increase in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(usize);

/// Processor kind a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Save,
    Delete,
    PropertyUpdate,
    DeleteWithoutLoading,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Save => "save",
            RequestKind::Delete => "delete",
            RequestKind::PropertyUpdate => "update property",
            RequestKind::DeleteWithoutLoading => "delete by criteria",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
struct InstanceFlags {
    /// Foreign keys and inverse fields were walked
    processed: bool,
    /// False for instances registered as context only
    to_process: bool,
}

#[derive(Debug)]
struct RequestNode {
    kind: RequestKind,
    label: String,
    executed: bool,
    dependencies: BTreeSet<RequestId>,
    instance: Option<InstanceFlags>,
}

impl RequestNode {
    fn is_done(&self) -> bool {
        self.executed || self.instance.is_some_and(|f| !f.to_process)
    }

    fn can_execute(&self) -> bool {
        !self.executed && self.instance.is_none_or(|f| f.processed && f.to_process)
    }
}

/// Arena of requests and their dependency edges.
#[derive(Debug, Default)]
pub struct RequestGraph {
    nodes: Vec<RequestNode>,
}

impl RequestGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request that does not target an instance.
    pub fn add(&mut self, kind: RequestKind, label: String) -> RequestId {
        self.push(kind, label, None)
    }

    /// Register an instance request.
    pub fn add_instance(&mut self, kind: RequestKind, label: String, to_process: bool) -> RequestId {
        self.push(
            kind,
            label,
            Some(InstanceFlags {
                processed: false,
                to_process,
            }),
        )
    }

    fn push(&mut self, kind: RequestKind, label: String, instance: Option<InstanceFlags>) -> RequestId {
        let id = RequestId(self.nodes.len());
        self.nodes.push(RequestNode {
            kind,
            label,
            executed: false,
            dependencies: BTreeSet::new(),
            instance,
        });
        id
    }

    fn node(&self, id: RequestId) -> &RequestNode {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: RequestId) -> &mut RequestNode {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn kind(&self, id: RequestId) -> RequestKind {
        self.node(id).kind
    }

    pub fn label(&self, id: RequestId) -> &str {
        &self.node(id).label
    }

    /// Record that `request` may only execute after `dependency` is done.
    ///
    /// Edges to requests that are already done are dropped. An edge that
    /// would close a cycle of any length is rejected.
    pub fn depends_on(&mut self, request: RequestId, dependency: RequestId) -> Result<()> {
        if self.is_done(dependency) {
            return Ok(());
        }
        if request == dependency {
            return Err(self.cycle(vec![request, request]));
        }
        if let Some(mut path) = self.path(dependency, request) {
            path.insert(0, request);
            return Err(self.cycle(path));
        }
        self.node_mut(request).dependencies.insert(dependency);
        tracing::trace!(
            request = %self.label(request),
            dependency = %self.label(dependency),
            "Dependency added"
        );
        Ok(())
    }

    /// Dependency path from `from` to `to`, if one exists.
    fn path(&self, from: RequestId, to: RequestId) -> Option<Vec<RequestId>> {
        let mut stack = vec![(from, vec![from])];
        let mut seen = BTreeSet::new();
        while let Some((at, path)) = stack.pop() {
            if at == to {
                return Some(path);
            }
            if !seen.insert(at) {
                continue;
            }
            for &next in &self.node(at).dependencies {
                if !self.is_done(next) {
                    let mut next_path = path.clone();
                    next_path.push(next);
                    stack.push((next, next_path));
                }
            }
        }
        None
    }

    fn cycle(&self, path: Vec<RequestId>) -> Error {
        Error::Dependency(DependencyError::Cycle {
            path: path.iter().map(|&id| self.label(id).to_string()).collect(),
        })
    }

    /// Executed, or an instance request with nothing to write.
    pub fn is_done(&self, id: RequestId) -> bool {
        self.node(id).is_done()
    }

    pub fn is_executed(&self, id: RequestId) -> bool {
        self.node(id).executed
    }

    /// Whether the request can execute now; drops dependencies that are done.
    pub fn can_execute_request(&mut self, id: RequestId) -> bool {
        if !self.node(id).can_execute() {
            return false;
        }
        let done: Vec<RequestId> = self
            .node(id)
            .dependencies
            .iter()
            .copied()
            .filter(|&dep| self.is_done(dep))
            .collect();
        let node = self.node_mut(id);
        for dep in done {
            node.dependencies.remove(&dep);
        }
        node.dependencies.is_empty()
    }

    pub fn mark_executed(&mut self, id: RequestId) {
        self.node_mut(id).executed = true;
    }

    pub fn is_processed(&self, id: RequestId) -> bool {
        self.node(id).instance.is_some_and(|f| f.processed)
    }

    pub fn to_process(&self, id: RequestId) -> bool {
        self.node(id).instance.is_some_and(|f| f.to_process)
    }

    pub fn set_processed(&mut self, id: RequestId) {
        if let Some(flags) = self.node_mut(id).instance.as_mut() {
            flags.processed = true;
        }
    }

    pub fn set_to_process(&mut self, id: RequestId, value: bool) {
        if let Some(flags) = self.node_mut(id).instance.as_mut() {
            flags.to_process = value;
        }
    }

    /// Number of requests that are done.
    pub fn done_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_done()).count()
    }

    /// Labels of requests that are not done.
    pub fn pending_labels(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| !n.is_done())
            .map(|n| n.label.clone())
            .collect()
    }
}
