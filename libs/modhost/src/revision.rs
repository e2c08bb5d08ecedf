//! Revisions: immutable snapshots of a module's declared capabilities and
//! requirements.
//!
//! A module owns an ordered sequence of revisions; the head of the sequence
//! is *current* unless the module is uninstalled. Updating appends a new
//! current revision; refresh discards the non-current tail.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use semver::Version;

use crate::module::Module;

/// Namespace of package wires.
pub const PACKAGE_NAMESPACE: &str = "package";
/// Namespace of host/fragment attachment wires.
pub const HOST_NAMESPACE: &str = "host";

/// Attribute naming the package of a `package`-namespace capability.
pub const PACKAGE_ATTR: &str = "package";
/// Attribute naming the host of a `host`-namespace capability.
pub const HOST_ATTR: &str = "host";

/// Directive controlling requirement resolution.
pub const RESOLUTION_DIRECTIVE: &str = "resolution";
/// A requirement the resolver may leave unsatisfied.
pub const RESOLUTION_OPTIONAL: &str = "optional";
/// A requirement wired on demand through dynamic resolution.
pub const RESOLUTION_DYNAMIC: &str = "dynamic";

/// Revision type bit marking a fragment (attaches to a host revision and
/// never carries independent package wires).
pub const FRAGMENT_TYPE: u32 = 0x0000_0001;

/// An attributed claim a revision offers in a namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capability {
    pub namespace: String,
    pub attributes: BTreeMap<String, String>,
}

impl Capability {
    #[must_use]
    pub fn new(namespace: &str, attributes: &[(&str, &str)]) -> Self {
        Capability {
            namespace: namespace.to_owned(),
            attributes: attributes
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }

    /// A `package` capability exporting `name`.
    #[must_use]
    pub fn package(name: &str) -> Self {
        Capability::new(PACKAGE_NAMESPACE, &[(PACKAGE_ATTR, name)])
    }

    /// A `host` capability allowing fragments to attach to `name`.
    #[must_use]
    pub fn host(name: &str) -> Self {
        Capability::new(HOST_NAMESPACE, &[(HOST_ATTR, name)])
    }

    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// An attributed need a revision declares in a namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    pub namespace: String,
    pub attributes: BTreeMap<String, String>,
    pub directives: BTreeMap<String, String>,
}

impl Requirement {
    #[must_use]
    pub fn new(namespace: &str, attributes: &[(&str, &str)]) -> Self {
        Requirement {
            namespace: namespace.to_owned(),
            attributes: attributes
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            directives: BTreeMap::new(),
        }
    }

    /// A static `package` requirement on `name`.
    #[must_use]
    pub fn package(name: &str) -> Self {
        Requirement::new(PACKAGE_NAMESPACE, &[(PACKAGE_ATTR, name)])
    }

    /// A dynamic `package` requirement; `pattern` is an exact package name,
    /// `*`, or a `prefix.*` wildcard.
    #[must_use]
    pub fn dynamic_package(pattern: &str) -> Self {
        let mut req = Requirement::new(PACKAGE_NAMESPACE, &[(PACKAGE_ATTR, pattern)]);
        req.directives
            .insert(RESOLUTION_DIRECTIVE.to_owned(), RESOLUTION_DYNAMIC.to_owned());
        req
    }

    /// A `host` requirement attaching a fragment to `name`.
    #[must_use]
    pub fn host(name: &str) -> Self {
        Requirement::new(HOST_NAMESPACE, &[(HOST_ATTR, name)])
    }

    /// Mark this requirement optional for the resolver.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.directives
            .insert(RESOLUTION_DIRECTIVE.to_owned(), RESOLUTION_OPTIONAL.to_owned());
        self
    }

    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.directives.get(RESOLUTION_DIRECTIVE).map(String::as_str) == Some(RESOLUTION_OPTIONAL)
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.directives.get(RESOLUTION_DIRECTIVE).map(String::as_str) == Some(RESOLUTION_DYNAMIC)
    }

    /// Project a dynamic `package` requirement onto a concrete package name.
    ///
    /// Returns the specialized requirement when this is a dynamic package
    /// requirement whose pattern covers `package_name`.
    #[must_use]
    pub fn dynamic_projection(&self, package_name: &str) -> Option<Requirement> {
        if self.namespace != PACKAGE_NAMESPACE || !self.is_dynamic() {
            return None;
        }
        let pattern = self.attributes.get(PACKAGE_ATTR)?;
        let covered = pattern == "*"
            || pattern == package_name
            || pattern
                .strip_suffix(".*")
                .is_some_and(|prefix| {
                    package_name
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('.'))
                });
        if !covered {
            return None;
        }
        let mut projected = self.clone();
        projected
            .attributes
            .insert(PACKAGE_ATTR.to_owned(), package_name.to_owned());
        Some(projected)
    }

    /// Whether `capability` satisfies this requirement: same namespace and
    /// every requirement attribute present with an equal value.
    #[must_use]
    pub fn matches(&self, capability: &Capability) -> bool {
        self.namespace == capability.namespace
            && self
                .attributes
                .iter()
                .all(|(k, v)| capability.attributes.get(k) == Some(v))
    }
}

/// Identity of a revision inside the database's wiring map. Ids are unique
/// for the lifetime of a database and never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RevisionId(pub(crate) u64);

/// Opaque payload attached to a revision at install/update time.
pub type RevisionInfo = Arc<dyn Any + Send + Sync>;

/// An immutable snapshot of a module's declarations.
pub struct ModuleRevision {
    id: RevisionId,
    symbolic_name: String,
    version: Version,
    types: u32,
    capabilities: Vec<Capability>,
    requirements: Vec<Requirement>,
    revisions: Weak<ModuleRevisions>,
    info: Option<RevisionInfo>,
}

impl ModuleRevision {
    #[must_use]
    pub fn id(&self) -> RevisionId {
        self.id
    }

    #[must_use]
    pub fn symbolic_name(&self) -> &str {
        &self.symbolic_name
    }

    #[must_use]
    pub fn version(&self) -> &Version {
        &self.version
    }

    #[must_use]
    pub fn types(&self) -> u32 {
        self.types
    }

    #[must_use]
    pub fn is_fragment(&self) -> bool {
        self.types & FRAGMENT_TYPE != 0
    }

    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    #[must_use]
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    #[must_use]
    pub fn info(&self) -> Option<&RevisionInfo> {
        self.info.as_ref()
    }

    /// The revisions container this revision belongs to.
    ///
    /// # Panics
    /// The container strictly outlives its revisions; an expired reference
    /// is an internal error.
    #[must_use]
    pub fn revisions(&self) -> Arc<ModuleRevisions> {
        self.revisions
            .upgrade()
            .expect("a revision does not outlive its revisions container")
    }

    /// The owning module.
    #[must_use]
    pub fn module(&self) -> Arc<Module> {
        self.revisions().module()
    }

    /// Whether this revision is the current revision of its module.
    #[must_use]
    pub fn is_current(self: &Arc<Self>) -> bool {
        self.revisions()
            .current()
            .is_some_and(|current| Arc::ptr_eq(&current, self))
    }
}

impl std::fmt::Debug for ModuleRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRevision")
            .field("id", &self.id)
            .field("symbolic_name", &self.symbolic_name)
            .field("version", &self.version)
            .field("fragment", &self.is_fragment())
            .finish_non_exhaustive()
    }
}

/// Ordered revision sequence owned by a module; the head is current.
pub struct ModuleRevisions {
    module: Weak<Module>,
    list: Mutex<Vec<Arc<ModuleRevision>>>,
    uninstalled: AtomicBool,
}

impl ModuleRevisions {
    pub(crate) fn new(module: Weak<Module>) -> Self {
        ModuleRevisions {
            module,
            list: Mutex::new(Vec::new()),
            uninstalled: AtomicBool::new(false),
        }
    }

    /// The owning module.
    ///
    /// # Panics
    /// The module strictly outlives its revisions container; an expired
    /// reference is an internal error.
    #[must_use]
    pub fn module(&self) -> Arc<Module> {
        self.module
            .upgrade()
            .expect("a revisions container does not outlive its module")
    }

    /// The current revision, or `None` once the module is uninstalled.
    #[must_use]
    pub fn current(&self) -> Option<Arc<ModuleRevision>> {
        if self.is_uninstalled() {
            return None;
        }
        self.list.lock().first().cloned()
    }

    /// Every revision, current first.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<ModuleRevision>> {
        self.list.lock().clone()
    }

    #[must_use]
    pub fn is_uninstalled(&self) -> bool {
        self.uninstalled.load(Ordering::Acquire)
    }

    pub(crate) fn mark_uninstalled(&self) {
        self.uninstalled.store(true, Ordering::Release);
    }

    pub(crate) fn push_current(&self, revision: Arc<ModuleRevision>) {
        self.list.lock().insert(0, revision);
    }

    pub(crate) fn remove(&self, revision: &Arc<ModuleRevision>) {
        self.list.lock().retain(|r| !Arc::ptr_eq(r, revision));
    }
}

/// Supplies the identity and declarations of a revision being installed or
/// updated.
#[derive(Clone, Debug, Default)]
pub struct RevisionBuilder {
    symbolic_name: Option<String>,
    version: Option<Version>,
    types: u32,
    capabilities: Vec<Capability>,
    requirements: Vec<Requirement>,
}

impl RevisionBuilder {
    #[must_use]
    pub fn new() -> Self {
        RevisionBuilder::default()
    }

    #[must_use]
    pub fn symbolic_name(mut self, name: &str) -> Self {
        self.symbolic_name = Some(name.to_owned());
        self
    }

    #[must_use]
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Mark the revision as a fragment.
    #[must_use]
    pub fn fragment(mut self) -> Self {
        self.types |= FRAGMENT_TYPE;
        self
    }

    #[must_use]
    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    #[must_use]
    pub fn requirement(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// The symbolic name this builder carries, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.symbolic_name.as_deref()
    }

    /// The version this builder carries (defaults to `0.0.0`).
    #[must_use]
    pub fn build_version(&self) -> Version {
        self.version.clone().unwrap_or_else(|| Version::new(0, 0, 0))
    }

    pub(crate) fn build(
        self,
        id: RevisionId,
        revisions: &Arc<ModuleRevisions>,
        info: Option<RevisionInfo>,
    ) -> Arc<ModuleRevision> {
        let version = self.version.unwrap_or_else(|| Version::new(0, 0, 0));
        Arc::new(ModuleRevision {
            id,
            symbolic_name: self.symbolic_name.unwrap_or_default(),
            version,
            types: self.types,
            capabilities: self.capabilities,
            requirements: self.requirements,
            revisions: Arc::downgrade(revisions),
            info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirement_matching_is_attribute_subset() {
        let cap = Capability::new(PACKAGE_NAMESPACE, &[("package", "a.b"), ("vendor", "x")]);
        assert!(Requirement::package("a.b").matches(&cap));
        assert!(!Requirement::package("a.c").matches(&cap));
        assert!(!Requirement::host("a.b").matches(&cap));
    }

    #[test]
    fn dynamic_projection_covers_exact_star_and_prefix() {
        let exact = Requirement::dynamic_package("a.b");
        assert!(exact.dynamic_projection("a.b").is_some());
        assert!(exact.dynamic_projection("a.c").is_none());

        let star = Requirement::dynamic_package("*");
        let projected = star.dynamic_projection("any.pkg").unwrap();
        assert_eq!(projected.attributes.get(PACKAGE_ATTR).unwrap(), "any.pkg");

        let prefix = Requirement::dynamic_package("com.foo.*");
        assert!(prefix.dynamic_projection("com.foo.bar").is_some());
        assert!(prefix.dynamic_projection("com.foobar").is_none());
        assert!(prefix.dynamic_projection("com.foo").is_none());
    }

    #[test]
    fn static_requirements_do_not_project() {
        assert!(Requirement::package("a.b").dynamic_projection("a.b").is_none());
    }
}
