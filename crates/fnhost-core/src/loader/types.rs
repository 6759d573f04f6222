//! Declared and resolved types.
//!
//! An artifact declares [`TypeDef`]s inside a [`ModuleImage`]. A loader turns
//! a declaration into a [`TypeRef`] when the name is first resolved. Type
//! identity is pointer identity of the shared `ResolvedType`: two `TypeRef`s
//! are the same type only if they came out of the same definition.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use fnhost_guest::FUNCTION_CONTRACT;

use crate::context::FunctionHandler;
use crate::error::{Error, Result, panic_message};

/// Default constructor of a function type.
pub type Constructor =
    Arc<dyn Fn() -> std::result::Result<Box<dyn FunctionHandler>, String> + Send + Sync>;

/// Identifier of an [`IsolatedLoader`](super::IsolatedLoader) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(pub(crate) u64);

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader#{}", self.0)
    }
}

/// A type as declared by an artifact (or by host code).
#[derive(Clone)]
pub struct TypeDef {
    name: String,
    interfaces: Vec<String>,
    constructor: Option<Constructor>,
}

impl TypeDef {
    /// Declare a type with no interfaces and no constructor.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interfaces: Vec::new(),
            constructor: None,
        }
    }

    /// Declare a constructible type implementing the function contract.
    pub fn function<F, H>(name: impl Into<String>, construct: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: FunctionHandler + 'static,
    {
        Self::new(name)
            .implements(FUNCTION_CONTRACT)
            .with_constructor(move || Ok(Box::new(construct()) as Box<dyn FunctionHandler>))
    }

    /// Add an implemented interface, by name.
    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    /// Attach a fallible default constructor.
    pub fn with_constructor<F>(mut self, construct: F) -> Self
    where
        F: Fn() -> std::result::Result<Box<dyn FunctionHandler>, String> + Send + Sync + 'static,
    {
        self.constructor = Some(Arc::new(construct));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn has_constructor(&self) -> bool {
        self.constructor.is_some()
    }

    pub(crate) fn constructor(&self) -> Option<Constructor> {
        self.constructor.clone()
    }
}

impl fmt::Debug for TypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDef")
            .field("name", &self.name)
            .field("interfaces", &self.interfaces)
            .field("constructible", &self.constructor.is_some())
            .finish()
    }
}

/// Private symbol table of one opened artifact.
///
/// `resource` keeps whatever backs the definitions alive (for native
/// artifacts, the loaded library) until the image is dropped.
#[derive(Clone, Default)]
pub struct ModuleImage {
    types: HashMap<String, TypeDef>,
    resource: Option<Arc<dyn Any + Send + Sync>>,
}

impl ModuleImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, def: TypeDef) -> Self {
        self.insert(def);
        self
    }

    pub fn insert(&mut self, def: TypeDef) {
        self.types.insert(def.name.clone(), def);
    }

    pub fn with_resource(mut self, resource: Arc<dyn Any + Send + Sync>) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    /// Declared type names, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Where a resolved type was defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeOrigin {
    /// Canonical contract type owned by the host context.
    Contract,
    /// Library type provided by the host.
    Host,
    /// Private type defined by one loader's artifact.
    Artifact(LoaderId),
}

pub(crate) struct ResolvedType {
    name: String,
    origin: TypeOrigin,
    interfaces: Vec<TypeRef>,
    constructor: Option<Constructor>,
}

/// Handle to a resolved type. Cheap to clone; equality is identity.
#[derive(Clone)]
pub struct TypeRef(Arc<ResolvedType>);

impl TypeRef {
    pub(crate) fn define(
        name: impl Into<String>,
        origin: TypeOrigin,
        interfaces: Vec<TypeRef>,
        constructor: Option<Constructor>,
    ) -> Self {
        Self(Arc::new(ResolvedType {
            name: name.into(),
            origin,
            interfaces,
            constructor,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn origin(&self) -> TypeOrigin {
        self.0.origin
    }

    pub fn interfaces(&self) -> &[TypeRef] {
        &self.0.interfaces
    }

    /// Whether both handles denote the very same type.
    pub fn is_same(&self, other: &TypeRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Whether this type is, or transitively implements, `contract`.
    pub fn implements(&self, contract: &TypeRef) -> bool {
        self.is_same(contract) || self.0.interfaces.iter().any(|i| i.implements(contract))
    }

    pub fn is_constructible(&self) -> bool {
        self.0.constructor.is_some()
    }

    /// Build a default instance.
    ///
    /// Panics inside the constructor are caught and reported as
    /// [`Error::Instantiation`].
    pub fn instantiate(&self) -> Result<Box<dyn FunctionHandler>> {
        let construct = self
            .0
            .constructor
            .as_ref()
            .ok_or_else(|| Error::NoDefaultConstructor(self.0.name.clone()))?;

        match catch_unwind(AssertUnwindSafe(|| construct())) {
            Ok(Ok(instance)) => Ok(instance),
            Ok(Err(message)) => Err(Error::Instantiation {
                name: self.0.name.clone(),
                message,
            }),
            Err(payload) => Err(Error::Instantiation {
                name: self.0.name.clone(),
                message: format!("constructor panicked: {}", panic_message(payload.as_ref())),
            }),
        }
    }
}

impl PartialEq for TypeRef {
    fn eq(&self, other: &Self) -> bool {
        self.is_same(other)
    }
}

impl Eq for TypeRef {}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRef")
            .field("name", &self.0.name)
            .field("origin", &self.0.origin)
            .field("ptr", &Arc::as_ptr(&self.0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{HandlerError, Value, handler_fn};

    #[test]
    fn test_identity_is_pointer_identity() {
        let a = TypeRef::define("x.A", TypeOrigin::Host, Vec::new(), None);
        let b = TypeRef::define("x.A", TypeOrigin::Host, Vec::new(), None);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_implements_is_transitive() {
        let contract = TypeRef::define("c.Contract", TypeOrigin::Contract, Vec::new(), None);
        let middle = TypeRef::define("x.Base", TypeOrigin::Host, vec![contract.clone()], None);
        let leaf = TypeRef::define("x.Leaf", TypeOrigin::Host, vec![middle], None);
        let other = TypeRef::define("x.Other", TypeOrigin::Host, Vec::new(), None);
        assert!(leaf.implements(&contract));
        assert!(!other.implements(&contract));
    }

    fn ctor<F>(f: F) -> Constructor
    where
        F: Fn() -> std::result::Result<Box<dyn FunctionHandler>, String> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    #[test]
    fn test_instantiate_failures() {
        let abstract_type = TypeRef::define("x.Abstract", TypeOrigin::Host, Vec::new(), None);
        assert!(matches!(
            abstract_type.instantiate(),
            Err(Error::NoDefaultConstructor(_))
        ));

        let failing = ctor(|| Err("no database".to_string()));
        let failing = TypeRef::define("x.Failing", TypeOrigin::Host, Vec::new(), Some(failing));
        assert!(matches!(failing.instantiate(), Err(Error::Instantiation { .. })));

        let panicking = ctor(|| panic!("ctor exploded"));
        let panicking = TypeRef::define("x.Panics", TypeOrigin::Host, Vec::new(), Some(panicking));
        match panicking.instantiate() {
            Err(Error::Instantiation { message, .. }) => assert!(message.contains("ctor exploded")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_function_typedef() {
        let def = TypeDef::function("x.Echo", || {
            handler_fn(|_input, _ctx| Ok::<Value, HandlerError>(Value::Null))
        });
        assert_eq!(def.interfaces(), &[FUNCTION_CONTRACT.to_string()]);
        assert!(def.has_constructor());
    }
}
