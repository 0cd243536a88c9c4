use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::compiler;
use super::descriptor::ObjectRef;
use super::error::BridgeError;

/// Opaque identifier handed to scripts for one registration lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registration record of one exposed instance.
///
/// Watchers hold it weakly; the registry holds the only long-lived strong
/// reference and marks it dead when the last path bound to it goes away.
pub struct BoundObject {
    id: ObjectId,
    object: ObjectRef,
    live: AtomicBool,
}

impl BoundObject {
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn release(&self) {
        self.live.store(false, Ordering::Release);
    }
}

impl fmt::Debug for BoundObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundObject")
            .field("id", &self.id)
            .field("object", &self.object)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Statements and bookkeeping produced by a registry mutation.
#[derive(Debug, Default)]
pub struct Registration {
    /// Script statements declaring (or removing) the affected stubs.
    pub statements: Vec<String>,
    /// Paths declared by `statements`, in emission order.
    pub paths: Vec<String>,
    /// Records created by this mutation; their watchers still need starting.
    pub bound: Vec<Arc<BoundObject>>,
    /// Records no longer reachable from any path.
    pub released: Vec<Arc<BoundObject>>,
}

impl Registration {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty() && self.bound.is_empty() && self.released.is_empty()
    }

    fn absorb(&mut self, other: Registration) {
        self.statements.extend(other.statements);
        self.paths.extend(other.paths);
        self.bound.extend(other.bound);
        self.released.extend(other.released);
    }
}

#[derive(Default)]
struct RegistryState {
    by_path: HashMap<String, Arc<BoundObject>>,
    by_id: HashMap<ObjectId, Arc<BoundObject>>,
    paths_by_id: HashMap<ObjectId, BTreeSet<String>>,
    by_instance: HashMap<usize, ObjectId>,
}

/// Path- and identifier-keyed index of exposed objects.
#[derive(Default)]
pub struct ObjectRegistry {
    state: RwLock<RegistryState>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `object` under `path` and walk its exposed children.
    ///
    /// Re-registering a path with a different instance replaces the whole
    /// subtree under it; the same instance keeps its identifier.
    ///
    /// A path that a registered parent declares as a child belongs to the
    /// parent's walk and is refused with [`BridgeError::DeclaredChild`].
    pub fn register(&self, path: &str, object: ObjectRef) -> Result<Registration, BridgeError> {
        validate_path(path)?;
        let mut state = self.state.write();
        state.ensure_not_declared(path)?;
        let mut registration = Registration::default();
        let mut visited = HashSet::new();
        state.bind(path, object, &mut visited, &mut registration);
        debug!(
            target: "bridge",
            %path,
            statements = registration.statements.len(),
            bound = registration.bound.len(),
            released = registration.released.len(),
            "registered object"
        );
        Ok(registration)
    }

    /// Remove `path` and every path nested under it.
    ///
    /// Declared children are removed by changing what their parent exposes.
    pub fn unregister(&self, path: &str) -> Result<Registration, BridgeError> {
        let mut state = self.state.write();
        state.ensure_not_declared(path)?;
        let mut registration = Registration::default();
        if state.release_subtree(path, &mut registration) {
            registration.statements.push(compiler::undefine_object(path));
        }
        Ok(registration)
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<BoundObject>> {
        self.state.read().by_id.get(&ObjectId::from(id)).cloned()
    }

    pub fn lookup_path(&self, path: &str) -> Option<Arc<BoundObject>> {
        self.state.read().by_path.get(path).cloned()
    }

    /// Registered paths without a `.`, sorted.
    pub fn roots(&self) -> Vec<String> {
        let state = self.state.read();
        let mut roots: Vec<String> = state
            .by_path
            .keys()
            .filter(|path| !path.contains('.'))
            .cloned()
            .collect();
        roots.sort();
        roots
    }

    /// Every registered path, parents before children.
    pub fn paths(&self) -> Vec<String> {
        let state = self.state.read();
        let mut paths: Vec<String> = state.by_path.keys().cloned().collect();
        paths.sort_by(|a, b| depth(a).cmp(&depth(b)).then_with(|| a.cmp(b)));
        paths
    }

    pub fn len(&self) -> usize {
        self.state.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().by_id.is_empty()
    }

    /// Re-walk every root, one walk per root, in path order.
    ///
    /// Paths registered explicitly below a root but not reachable through
    /// its declared children are re-declared after the walks.
    pub fn refresh_roots(&self) -> Registration {
        let mut state = self.state.write();
        let mut registration = Registration::default();
        let mut roots: Vec<(String, ObjectRef)> = state
            .by_path
            .iter()
            .filter(|(path, _)| !path.contains('.'))
            .map(|(path, bound)| (path.clone(), bound.object.clone()))
            .collect();
        roots.sort_by(|a, b| a.0.cmp(&b.0));

        for (path, object) in roots {
            let mut visited = HashSet::new();
            let mut walk = Registration::default();
            state.bind(&path, object, &mut visited, &mut walk);
            registration.absorb(walk);
        }

        let reached: HashSet<String> = registration.paths.iter().cloned().collect();
        let mut detached: Vec<String> = state
            .by_path
            .keys()
            .filter(|path| !reached.contains(*path))
            .cloned()
            .collect();
        detached.sort_by(|a, b| depth(a).cmp(&depth(b)).then_with(|| a.cmp(b)));
        for path in detached {
            if let Some(bound) = state.by_path.get(&path) {
                registration.statements.extend(object_statements(&path, bound));
                registration.paths.push(path);
            }
        }
        registration
    }

    /// Each registered path's own statements, without re-walking children.
    pub fn statements_by_path(&self) -> Vec<String> {
        let paths = self.paths();
        let state = self.state.read();
        let mut statements = Vec::new();
        for path in paths {
            if let Some(bound) = state.by_path.get(&path) {
                statements.extend(object_statements(&path, bound));
            }
        }
        statements
    }

    /// Drop every binding; used when the owning bridge closes.
    pub fn clear(&self) -> Registration {
        let mut state = self.state.write();
        let mut registration = Registration::default();
        for path in state.root_paths() {
            if state.release_subtree(&path, &mut registration) {
                registration.statements.push(compiler::undefine_object(&path));
            }
        }
        // Orphaned nested paths whose root was removed out of band.
        let leftovers: Vec<String> = state.by_path.keys().cloned().collect();
        for path in leftovers {
            state.release_subtree(&path, &mut registration);
        }
        registration
    }
}

impl RegistryState {
    fn ensure_not_declared(&self, path: &str) -> Result<(), BridgeError> {
        let Some((parent, name)) = path.rsplit_once('.') else {
            return Ok(());
        };
        let declared = self.by_path.get(parent).is_some_and(|bound| {
            bound
                .object
                .descriptor()
                .children()
                .iter()
                .any(|child| child.name() == name)
        });
        if declared {
            Err(BridgeError::DeclaredChild {
                path: path.to_string(),
                parent: parent.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn root_paths(&self) -> Vec<String> {
        let mut roots: Vec<String> = self
            .by_path
            .keys()
            .filter(|path| !path.contains('.'))
            .cloned()
            .collect();
        roots.sort();
        roots
    }

    fn bind(
        &mut self,
        path: &str,
        object: ObjectRef,
        visited: &mut HashSet<usize>,
        registration: &mut Registration,
    ) {
        visited.insert(object.identity());

        let bound = match self.by_path.get(path) {
            Some(existing) if existing.object.same_instance(&object) => Arc::clone(existing),
            _ => {
                self.release_subtree(path, registration);
                let bound = self.record_for(object, registration);
                self.by_path.insert(path.to_string(), Arc::clone(&bound));
                self.paths_by_id
                    .entry(bound.id.clone())
                    .or_default()
                    .insert(path.to_string());
                bound
            }
        };

        registration.statements.extend(object_statements(path, &bound));
        registration.paths.push(path.to_string());

        for child in bound.object.descriptor().children() {
            if !is_identifier(child.name()) {
                warn!(
                    target: "bridge",
                    %path,
                    child = child.name(),
                    "skipping child with a name scripts cannot address"
                );
                continue;
            }
            let child_path = format!("{path}.{}", child.name());
            match child.resolve(bound.object.instance()) {
                Some(child_object) if !visited.contains(&child_object.identity()) => {
                    self.bind(&child_path, child_object, visited, registration);
                }
                Some(_) => {
                    debug!(
                        target: "bridge",
                        path = %child_path,
                        "child already visited in this walk; not descending"
                    );
                    self.release_child(&child_path, registration);
                }
                None => self.release_child(&child_path, registration),
            }
        }
    }

    /// Drop a child the parent no longer exposes, from the page as well.
    fn release_child(&mut self, path: &str, registration: &mut Registration) {
        if self.release_subtree(path, registration) {
            registration.statements.push(compiler::undefine_object(path));
        }
    }

    /// Existing record for an instance bound elsewhere, or a fresh one.
    fn record_for(&mut self, object: ObjectRef, registration: &mut Registration) -> Arc<BoundObject> {
        if let Some(existing) = self
            .by_instance
            .get(&object.identity())
            .and_then(|id| self.by_id.get(id))
        {
            return Arc::clone(existing);
        }

        let bound = Arc::new(BoundObject {
            id: ObjectId::generate(),
            object,
            live: AtomicBool::new(true),
        });
        self.by_instance
            .insert(bound.object.identity(), bound.id.clone());
        self.by_id.insert(bound.id.clone(), Arc::clone(&bound));
        registration.bound.push(Arc::clone(&bound));
        bound
    }

    /// Returns whether `path` itself was bound.
    fn release_subtree(&mut self, path: &str, registration: &mut Registration) -> bool {
        let prefix = format!("{path}.");
        let doomed: Vec<String> = self
            .by_path
            .keys()
            .filter(|candidate| candidate.as_str() == path || candidate.starts_with(&prefix))
            .cloned()
            .collect();

        let mut removed_root = false;
        for doomed_path in doomed {
            removed_root |= doomed_path == path;
            let Some(bound) = self.by_path.remove(&doomed_path) else {
                continue;
            };
            let now_unreferenced = match self.paths_by_id.get_mut(&bound.id) {
                Some(paths) => {
                    paths.remove(&doomed_path);
                    paths.is_empty()
                }
                None => true,
            };
            if now_unreferenced {
                self.paths_by_id.remove(&bound.id);
                self.by_id.remove(&bound.id);
                self.by_instance.remove(&bound.object.identity());
                bound.release();
                registration.released.push(bound);
            }
        }
        removed_root
    }
}

fn object_statements(path: &str, bound: &BoundObject) -> Vec<String> {
    let descriptor = bound.object.descriptor();
    let mut statements = vec![compiler::define_object(path, &bound.id)];
    statements.extend(
        descriptor
            .functions()
            .map(|function| compiler::define_function(path, function.name(), &bound.id)),
    );
    statements.extend(
        descriptor
            .properties()
            .map(|property| compiler::define_property(path, property.name())),
    );
    statements
}

fn depth(path: &str) -> usize {
    path.matches('.').count()
}

fn validate_path(path: &str) -> Result<(), BridgeError> {
    if !path.is_empty() && path.split('.').all(is_identifier) {
        Ok(())
    } else {
        Err(BridgeError::InvalidPath {
            path: path.to_string(),
        })
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == '$' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '$')
}
