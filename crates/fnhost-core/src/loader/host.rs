//! The shared parent context and the namespace policy.
//!
//! There is exactly one [`HostContext`] per runtime. It owns the canonical
//! contract types, so every loader that delegates a contract name to it gets
//! the same [`TypeRef`] back. That is what lets the executor check an
//! artifact's entry type against the host's function contract.

use std::collections::HashMap;

use fnhost_guest::{CONTRACT_NAMESPACE, EXECUTION_CONTEXT, FUNCTION_CONTRACT, HANDLER_ERROR};

use super::types::{TypeDef, TypeOrigin, TypeRef};
use crate::error::{Error, Result};

/// Namespace class of a fully qualified type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Canonical contract types; always answered by the host.
    Contract,
    /// Platform/runtime-reserved names; always answered by the host.
    Platform,
    /// Shared marshaling libraries; always answered by the host.
    Shared,
    /// Everything else; artifacts define these privately.
    Private,
}

/// Prefix lists that decide which names never resolve inside an artifact.
#[derive(Debug, Clone)]
pub struct NamespacePolicy {
    contract: Vec<String>,
    platform: Vec<String>,
    shared: Vec<String>,
}

impl Default for NamespacePolicy {
    fn default() -> Self {
        Self {
            contract: vec![CONTRACT_NAMESPACE.to_string()],
            platform: ["std.", "core.", "alloc.", "fnhost.runtime."]
                .into_iter()
                .map(String::from)
                .collect(),
            shared: ["serde.", "serde_json."]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl NamespacePolicy {
    /// Add a platform-reserved prefix (e.g. `"acme.runtime."`).
    pub fn with_platform_namespace(mut self, prefix: impl Into<String>) -> Self {
        self.platform.push(prefix.into());
        self
    }

    /// Add a shared marshaling-library prefix.
    pub fn with_shared_namespace(mut self, prefix: impl Into<String>) -> Self {
        self.shared.push(prefix.into());
        self
    }

    /// Classify a name. Contract wins over platform, platform over shared.
    pub fn classify(&self, name: &str) -> Namespace {
        let matches = |prefixes: &[String]| prefixes.iter().any(|p| name.starts_with(p.as_str()));
        if matches(&self.contract) {
            Namespace::Contract
        } else if matches(&self.platform) {
            Namespace::Platform
        } else if matches(&self.shared) {
            Namespace::Shared
        } else {
            Namespace::Private
        }
    }
}

/// Shared parent context of all isolated loaders.
#[derive(Debug)]
pub struct HostContext {
    policy: NamespacePolicy,
    types: HashMap<String, TypeRef>,
    function_contract: TypeRef,
}

impl HostContext {
    /// Host context with the default policy and only the contract types.
    pub fn new() -> Self {
        let function_contract = contract_type(FUNCTION_CONTRACT);
        let mut types = HashMap::new();
        types.insert(FUNCTION_CONTRACT.to_string(), function_contract.clone());
        for name in [EXECUTION_CONTEXT, HANDLER_ERROR] {
            types.insert(name.to_string(), contract_type(name));
        }
        Self {
            policy: NamespacePolicy::default(),
            types,
            function_contract,
        }
    }

    pub fn builder() -> HostContextBuilder {
        HostContextBuilder::default()
    }

    pub fn policy(&self) -> &NamespacePolicy {
        &self.policy
    }

    /// Look a name up in the host's own table.
    pub fn lookup(&self, name: &str) -> Option<TypeRef> {
        self.types.get(name).cloned()
    }

    /// The canonical function contract type.
    pub fn function_contract(&self) -> &TypeRef {
        &self.function_contract
    }

    /// Names of every host-owned type, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for HostContext {
    fn default() -> Self {
        Self::new()
    }
}

fn contract_type(name: &str) -> TypeRef {
    TypeRef::define(name, TypeOrigin::Contract, Vec::new(), None)
}

/// Builder for a [`HostContext`] with host-provided library types.
#[derive(Default)]
pub struct HostContextBuilder {
    policy: NamespacePolicy,
    provided: Vec<TypeDef>,
}

impl HostContextBuilder {
    pub fn policy(mut self, policy: NamespacePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Provide a host library type. Interfaces must name contract types or
    /// types provided earlier.
    pub fn provide(mut self, def: TypeDef) -> Self {
        self.provided.push(def);
        self
    }

    pub fn build(self) -> Result<HostContext> {
        let mut host = HostContext::new();
        host.policy = self.policy;

        for def in self.provided {
            if host.policy.classify(def.name()) == Namespace::Contract {
                return Err(Error::Configuration(format!(
                    "host type {} is inside the contract namespace",
                    def.name()
                )));
            }
            let interfaces = def
                .interfaces()
                .iter()
                .map(|name| {
                    host.types.get(name).cloned().ok_or_else(|| Error::Resolution {
                        name: def.name().to_string(),
                        message: format!("unknown interface {name}"),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let resolved =
                TypeRef::define(def.name(), TypeOrigin::Host, interfaces, def.constructor());
            host.types.insert(def.name().to_string(), resolved);
        }

        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_classification() {
        let policy = NamespacePolicy::default().with_shared_namespace("acme.codec.");
        assert_eq!(policy.classify(FUNCTION_CONTRACT), Namespace::Contract);
        assert_eq!(policy.classify("std.String"), Namespace::Platform);
        assert_eq!(policy.classify("serde_json.Value"), Namespace::Shared);
        assert_eq!(policy.classify("acme.codec.Json"), Namespace::Shared);
        assert_eq!(policy.classify("hello.Hello"), Namespace::Private);
    }

    #[test]
    fn test_contract_types_present() {
        let host = HostContext::new();
        let contract = host.lookup(FUNCTION_CONTRACT).unwrap();
        assert!(contract.is_same(host.function_contract()));
        assert_eq!(contract.origin(), TypeOrigin::Contract);
        assert!(host.lookup(EXECUTION_CONTEXT).is_some());
        assert!(host.lookup(HANDLER_ERROR).is_some());
    }

    #[test]
    fn test_builder_provides_host_types() {
        let host = HostContext::builder()
            .provide(TypeDef::new("host.Base").implements(FUNCTION_CONTRACT))
            .provide(TypeDef::new("host.Derived").implements("host.Base"))
            .build()
            .unwrap();
        let derived = host.lookup("host.Derived").unwrap();
        assert_eq!(derived.origin(), TypeOrigin::Host);
        assert!(derived.implements(host.function_contract()));
    }

    #[test]
    fn test_builder_rejects_contract_namespace_and_unknown_interfaces() {
        let err = HostContext::builder()
            .provide(TypeDef::new("fnhost.contract.Fake"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = HostContext::builder()
            .provide(TypeDef::new("host.Orphan").implements("host.Missing"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Resolution { .. }));
    }
}
