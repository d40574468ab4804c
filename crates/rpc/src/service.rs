//! Service and method descriptors.
//!
//! A service has a dotted full name (`package.Service`) and a set of methods,
//! each with a request and a response message type. Method lookups accept
//! names whose first letter is lower-case (`echo` resolves `Echo`).

use std::any::{TypeId, type_name};
use std::borrow::Cow;

/// Identity of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    id: TypeId,
    name: &'static str,
}

impl TypeDescriptor {
    /// Describe `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Rust type name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// One RPC method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    name: String,
    parent: Option<String>,
    request: TypeDescriptor,
    response: TypeDescriptor,
}

impl MethodDescriptor {
    /// A method not (yet) attached to a service.
    #[must_use]
    pub fn new<Req, Resp>(name: impl Into<String>) -> Self
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + Default + 'static,
    {
        Self {
            name: name.into(),
            parent: None,
            request: TypeDescriptor::of::<Req>(),
            response: TypeDescriptor::of::<Resp>(),
        }
    }

    /// Simple method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full name of the owning service.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// `package.Service.Method`, or the simple name for orphans.
    #[must_use]
    pub fn full_name(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{parent}.{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Request message type.
    #[must_use]
    pub const fn request_type(&self) -> TypeDescriptor {
        self.request
    }

    /// Response message type.
    #[must_use]
    pub const fn response_type(&self) -> TypeDescriptor {
        self.response
    }
}

/// A named group of methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    full_name: String,
    methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    /// Start describing the service `full_name`.
    #[must_use]
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            methods: Vec::new(),
        }
    }

    /// Add a method.
    #[must_use]
    pub fn method<Req, Resp>(self, name: impl Into<String>) -> Self
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + Default + 'static,
    {
        self.with_method(MethodDescriptor::new::<Req, Resp>(name))
    }

    /// Attach an existing method descriptor.
    #[must_use]
    pub fn with_method(mut self, mut method: MethodDescriptor) -> Self {
        method.parent = Some(self.full_name.clone());
        self.methods.push(method);
        self
    }

    /// `package.Service`.
    #[must_use]
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// The last segment of the full name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.full_name
            .rsplit_once('.')
            .map_or(self.full_name.as_str(), |(_, name)| name)
    }

    /// All methods, in declaration order.
    #[must_use]
    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    /// Look a method up by name.
    #[must_use]
    pub fn find_method(&self, name: &str) -> Option<&MethodDescriptor> {
        let normalized = normalize(name);
        self.methods
            .iter()
            .find(|method| method.name == name)
            .or_else(|| self.methods.iter().find(|method| method.name == normalized))
    }
}

/// The services known to a client or server.
#[derive(Debug, Clone, Default)]
pub struct Services {
    services: Vec<ServiceDescriptor>,
}

impl Services {
    /// Full names of all services, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.services.iter().map(ServiceDescriptor::full_name).collect()
    }

    /// Look a service up by full name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services
            .iter()
            .find(|service| service.full_name == name)
            .or_else(|| {
                let normalized = normalize_service(name);
                self.services
                    .iter()
                    .find(|service| service.full_name == normalized)
            })
    }

    /// The only service, when there is exactly one.
    #[must_use]
    pub fn default_service(&self) -> Option<&ServiceDescriptor> {
        match self.services.as_slice() {
            [service] => Some(service),
            _ => None,
        }
    }

    /// Iterate over the services.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.iter()
    }

    /// Number of services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether there are none.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl FromIterator<ServiceDescriptor> for Services {
    fn from_iter<I: IntoIterator<Item = ServiceDescriptor>>(iter: I) -> Self {
        Self {
            services: iter.into_iter().collect(),
        }
    }
}

/// A service given by descriptor or by name.
#[derive(Debug, Clone, Copy)]
pub enum ServiceRef<'a> {
    /// Full name, first letter of the last segment may be lower-case.
    Name(&'a str),
    /// A descriptor.
    Descriptor(&'a ServiceDescriptor),
}

impl<'a> From<&'a str> for ServiceRef<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl<'a> From<&'a String> for ServiceRef<'a> {
    fn from(name: &'a String) -> Self {
        Self::Name(name)
    }
}

impl<'a> From<&'a ServiceDescriptor> for ServiceRef<'a> {
    fn from(service: &'a ServiceDescriptor) -> Self {
        Self::Descriptor(service)
    }
}

/// A method given by descriptor or by name.
#[derive(Debug, Clone, Copy)]
pub enum MethodRef<'a> {
    /// Simple or dotted (`package.Service.method`) name.
    Name(&'a str),
    /// A descriptor.
    Descriptor(&'a MethodDescriptor),
}

impl<'a> From<&'a str> for MethodRef<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl<'a> From<&'a String> for MethodRef<'a> {
    fn from(name: &'a String) -> Self {
        Self::Name(name)
    }
}

impl<'a> From<&'a MethodDescriptor> for MethodRef<'a> {
    fn from(method: &'a MethodDescriptor) -> Self {
        Self::Descriptor(method)
    }
}

/// Upper-case the first letter.
#[must_use]
pub fn normalize(name: &str) -> Cow<'_, str> {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_lowercase() => {
            Cow::Owned(first.to_uppercase().chain(chars).collect())
        }
        _ => Cow::Borrowed(name),
    }
}

/// Upper-case the first letter of the last segment of a dotted name.
#[must_use]
pub fn normalize_service(name: &str) -> Cow<'_, str> {
    match name.rsplit_once('.') {
        Some((namespace, simple)) => match normalize(simple) {
            Cow::Owned(simple) => Cow::Owned(format!("{namespace}.{simple}")),
            Cow::Borrowed(_) => Cow::Borrowed(name),
        },
        None => normalize(name),
    }
}
