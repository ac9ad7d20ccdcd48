use std::collections::{HashSet, VecDeque};

use cryo_types::{RawHandle, TrackedObject};

/// Source of the live object graph. Implemented by the embedder, which
/// knows which objects reference which.
pub trait ObjectGraph {
    /// Calls `visit` once for each object that `object` directly references.
    fn visit_dependencies(&self, object: &TrackedObject, visit: &mut dyn FnMut(TrackedObject));

    /// Hands back the walk's duplicate reference to `object`.
    ///
    /// Visiting an object conceptually duplicates a reference to it so the
    /// application cannot destroy it mid-capture; the pass calls this exactly
    /// once per visited object (diagnostics included) when it is done. The
    /// application's own references are never touched. Embedders without
    /// reference counting can leave the default no-op.
    fn release(&self, object: &TrackedObject) {
        let _ = object;
    }
}

/// One object picked up by the walk, with the handles it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratedObject {
    pub object: TrackedObject,
    pub deps: Vec<RawHandle>,
}

pub struct Enumeration {
    /// Breadth-first from the roots: every object ahead of the objects
    /// that reference it back, each exactly once.
    pub objects: Vec<EnumeratedObject>,
    /// Diagnostic-only objects encountered and dropped from the manifest.
    /// Still walked, so still owed a [`ObjectGraph::release`].
    pub diagnostics: Vec<TrackedObject>,
}

impl Enumeration {
    /// Releases the walk's reference to everything it visited, manifest
    /// members and filtered diagnostics alike.
    pub fn release_all<G: ObjectGraph + ?Sized>(&self, graph: &G) {
        for entry in &self.objects {
            graph.release(&entry.object);
        }
        for object in &self.diagnostics {
            graph.release(object);
        }
    }
}

/// Walks the graph from `roots`, de-duplicating on handle and dropping
/// diagnostic-only objects (they are not part of a restore point).
pub fn enumerate<G: ObjectGraph + ?Sized>(graph: &G, roots: &[TrackedObject]) -> Enumeration {
    let mut seen: HashSet<RawHandle> = HashSet::new();
    let mut queue: VecDeque<TrackedObject> = VecDeque::new();
    let mut objects = Vec::new();
    let mut diagnostics = Vec::new();

    for root in roots {
        if root.kind.is_diagnostic() {
            if seen.insert(root.handle) {
                diagnostics.push(*root);
            }
            continue;
        }
        if seen.insert(root.handle) {
            queue.push_back(*root);
        }
    }

    while let Some(object) = queue.pop_front() {
        let mut deps = Vec::new();
        graph.visit_dependencies(&object, &mut |dep| {
            if dep.kind.is_diagnostic() {
                if seen.insert(dep.handle) {
                    diagnostics.push(dep);
                }
                return;
            }
            deps.push(dep.handle);
            if seen.insert(dep.handle) {
                queue.push_back(dep);
            }
        });
        objects.push(EnumeratedObject { object, deps });
    }

    Enumeration {
        objects,
        diagnostics,
    }
}
