//! Call-site identity: one declared point of use of a fault-tolerance-governed unit of work.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

/// A parameter (or result) type in a method signature.
#[derive(Clone, Copy)]
pub struct ParamType {
    id: TypeId,
    name: &'static str,
}

impl ParamType {
    /// The parameter type `P`.
    pub fn of<P: 'static>() -> Self {
        Self { id: TypeId::of::<P>(), name: std::any::type_name::<P>() }
    }

    /// Type name, for diagnostics only.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ParamType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ParamType {}

impl std::hash::Hash for ParamType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[derive(PartialEq, Eq, Hash)]
struct Key {
    owner: String,
    method: String,
    params: Vec<ParamType>,
}

/// Owning type + method signature. Cheap to clone; equality and hashing are structural, so two
/// invocations from the same declaration always resolve to the same identity.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CallSite {
    key: Arc<Key>,
}

impl CallSite {
    /// Call-site for a method without parameters.
    pub fn new(owner: impl Into<String>, method: impl Into<String>) -> Self {
        Self::with_params(owner, method, Vec::new())
    }

    /// Call-site for a method with the given parameter types.
    pub fn with_params(
        owner: impl Into<String>,
        method: impl Into<String>,
        params: Vec<ParamType>,
    ) -> Self {
        Self { key: Arc::new(Key { owner: owner.into(), method: method.into(), params }) }
    }

    /// Owning type name.
    pub fn owner(&self) -> &str {
        &self.key.owner
    }

    /// Method name.
    pub fn method(&self) -> &str {
        &self.key.method
    }

    /// Declared parameter types.
    pub fn params(&self) -> &[ParamType] {
        &self.key.params
    }

    /// Name of a policy layer for this call-site, e.g. `Retry[Owner#method]`.
    pub fn label(&self, policy: &str) -> String {
        format!("{policy}[{self}]")
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.key.owner, self.key.method)
    }
}

impl fmt::Debug for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}{:?}", self.key.owner, self.key.method, self.key.params)
    }
}
