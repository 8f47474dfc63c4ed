//! Static per-type API descriptors.
//!
//! A descriptor lists the replicable members of a type by stable index and
//! carries a 160-bit content signature. Source and replica compare
//! signatures during the handshake; any difference in names, types, order or
//! property modifiers refuses the binding.
//!
//! Descriptors are normally emitted by an interface compiler. The
//! [`ApiDescriptorBuilder`] produces the same table by hand.

use crate::types::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// How a property may change and who may write it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyModifier {
    /// Sent once with the initial state, never changes afterwards.
    Constant,
    /// Changed only by the source.
    ReadOnly,
    /// Replicas may write it through the source's setter.
    ReadWrite,
    /// Replicas may push a value through a dedicated push slot.
    ReadPush,
    /// Source has a setter that is not exposed to replicas.
    SourceOnlySetter,
}

impl PropertyModifier {
    fn tag(self) -> u8 {
        match self {
            PropertyModifier::Constant => 0,
            PropertyModifier::ReadOnly => 1,
            PropertyModifier::ReadWrite => 2,
            PropertyModifier::ReadPush => 3,
            PropertyModifier::SourceOnlySetter => 4,
        }
    }

    pub fn writable_from_replica(self) -> bool {
        matches!(self, PropertyModifier::ReadWrite | PropertyModifier::ReadPush)
    }

    pub fn notifies(self) -> bool {
        self != PropertyModifier::Constant
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDef {
    pub name: String,
    pub type_name: String,
    pub modifier: PropertyModifier,
    pub default: Value,
    /// Stored on replica teardown and used to seed the next session.
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDef {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalDef {
    pub name: String,
    pub params: Vec<ParamDef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    pub name: String,
    pub params: Vec<ParamDef>,
    /// `None` for void methods; only non-void calls get a pending reply.
    pub return_type: Option<String>,
}

/// Immutable member table for one replicable type.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiDescriptor {
    type_name: String,
    properties: Vec<PropertyDef>,
    signals: Vec<SignalDef>,
    methods: Vec<MethodDef>,
    signature: [u8; 20],
}

impl ApiDescriptor {
    pub fn builder(type_name: impl Into<String>) -> ApiDescriptorBuilder {
        ApiDescriptorBuilder {
            type_name: type_name.into(),
            properties: Vec::new(),
            signals: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    pub fn signals(&self) -> &[SignalDef] {
        &self.signals
    }

    pub fn methods(&self) -> &[MethodDef] {
        &self.methods
    }

    pub fn property(&self, index: usize) -> Option<&PropertyDef> {
        self.properties.get(index)
    }

    pub fn method(&self, index: usize) -> Option<&MethodDef> {
        self.methods.get(index)
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    pub fn signal_index(&self, name: &str) -> Option<usize> {
        self.signals.iter().position(|s| s.name == name)
    }

    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name)
    }

    pub fn signature(&self) -> &[u8; 20] {
        &self.signature
    }

    /// Lowercase hex form used on the wire and as the persistence key.
    pub fn signature_hex(&self) -> String {
        hex::encode(self.signature)
    }

    pub fn has_persisted_properties(&self) -> bool {
        self.properties.iter().any(|p| p.persisted)
    }
}

pub struct ApiDescriptorBuilder {
    type_name: String,
    properties: Vec<PropertyDef>,
    signals: Vec<SignalDef>,
    methods: Vec<MethodDef>,
}

fn params(list: &[(&str, &str)]) -> Vec<ParamDef> {
    list.iter()
        .map(|(name, type_name)| ParamDef {
            name: name.to_string(),
            type_name: type_name.to_string(),
        })
        .collect()
}

impl ApiDescriptorBuilder {
    pub fn property(
        mut self,
        name: &str,
        type_name: &str,
        modifier: PropertyModifier,
        default: impl Into<Value>,
    ) -> Self {
        self.properties.push(PropertyDef {
            name: name.to_string(),
            type_name: type_name.to_string(),
            modifier,
            default: default.into(),
            persisted: false,
        });
        self
    }

    /// Marks the most recently added property as persisted.
    pub fn persisted(mut self) -> Self {
        if let Some(last) = self.properties.last_mut() {
            last.persisted = true;
        }
        self
    }

    pub fn signal(mut self, name: &str, signal_params: &[(&str, &str)]) -> Self {
        self.signals.push(SignalDef {
            name: name.to_string(),
            params: params(signal_params),
        });
        self
    }

    pub fn method(
        mut self,
        name: &str,
        method_params: &[(&str, &str)],
        return_type: Option<&str>,
    ) -> Self {
        self.methods.push(MethodDef {
            name: name.to_string(),
            params: params(method_params),
            return_type: return_type.map(str::to_string),
        });
        self
    }

    pub fn build(self) -> Arc<ApiDescriptor> {
        let signature = compute_signature(
            &self.type_name,
            &self.properties,
            &self.signals,
            &self.methods,
        );
        Arc::new(ApiDescriptor {
            type_name: self.type_name,
            properties: self.properties,
            signals: self.signals,
            methods: self.methods,
            signature,
        })
    }
}

/// SHA-256, truncated to 160 bits, over the type name, then each property's name, type and modifier,
/// then signals and methods as name + (param name, param type)* + return type.
fn compute_signature(
    type_name: &str,
    properties: &[PropertyDef],
    signals: &[SignalDef],
    methods: &[MethodDef],
) -> [u8; 20] {
    let mut hasher = Sha256::new();
    hasher.update(type_name.as_bytes());

    for p in properties {
        hasher.update(p.name.as_bytes());
        hasher.update(p.type_name.as_bytes());
        hasher.update([p.modifier.tag()]);
    }

    let mut function = |name: &str, params: &[ParamDef], return_type: &str| {
        hasher.update(name.as_bytes());
        for param in params {
            hasher.update(param.name.as_bytes());
            hasher.update(param.type_name.as_bytes());
        }
        hasher.update(return_type.as_bytes());
    };
    for s in signals {
        function(&s.name, &s.params, "void");
    }
    for m in methods {
        function(&m.name, &m.params, m.return_type.as_deref().unwrap_or("void"));
    }

    let digest = hasher.finalize();
    let mut signature = [0u8; 20];
    signature.copy_from_slice(&digest[..20]);
    signature
}
