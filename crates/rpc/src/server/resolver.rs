//! Maps `service.method` to handlers.
//!
//! Handlers are stored under the method's full dotted name, so services in
//! different packages may define methods with the same simple name.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use parking_lot::RwLock;

use super::connection::Connection;
use crate::codec;
use crate::error::{DispatchError, ResolveError};
use crate::service::{MethodDescriptor, MethodRef, ServiceDescriptor, ServiceRef, Services};

/// A handler with its message types erased.
pub(crate) trait ErasedHandler: Send + Sync + 'static {
    fn call(
        &self,
        payload: Bytes,
        connection: Connection,
    ) -> BoxFuture<'static, Result<Bytes, DispatchError>>;
}

/// Adapts `Fn(Req, Connection) -> Future<Output = anyhow::Result<Resp>>`.
pub(crate) struct TypedHandler<Req, Resp, F> {
    handler: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> TypedHandler<Req, Resp, F> {
    pub(crate) const fn new(handler: F) -> Self {
        Self {
            handler,
            _types: PhantomData,
        }
    }
}

impl<Req, Resp, F, Fut> ErasedHandler for TypedHandler<Req, Resp, F>
where
    Req: prost::Message + Default + 'static,
    Resp: prost::Message + 'static,
    F: Fn(Req, Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
{
    fn call(
        &self,
        payload: Bytes,
        connection: Connection,
    ) -> BoxFuture<'static, Result<Bytes, DispatchError>> {
        let request = match codec::decode::<Req>(&payload) {
            Ok(request) => request,
            Err(e) => return future::ready(Err(e.into())).boxed(),
        };

        let response = (self.handler)(request, connection);
        async move {
            response
                .await
                .map(|response| codec::encode(&response))
                .map_err(|e| DispatchError::Handler(e.to_string()))
        }
        .boxed()
    }
}

pub(crate) struct MethodResolver {
    services: Services,
    handlers: RwLock<HashMap<String, Arc<dyn ErasedHandler>>>,
}

impl MethodResolver {
    pub(crate) fn new(services: Services) -> Result<Self, ResolveError> {
        if services.is_empty() {
            return Err(ResolveError::NoServices);
        }

        let mut seen = HashSet::new();
        for name in services.names() {
            if !seen.insert(name) {
                return Err(ResolveError::DuplicateService(name.to_string()));
            }
        }

        Ok(Self {
            services,
            handlers: RwLock::new(HashMap::new()),
        })
    }

    pub(crate) const fn services(&self) -> &Services {
        &self.services
    }

    /// Find the method an `implement` call refers to.
    pub(crate) fn target(
        &self,
        service: Option<ServiceRef<'_>>,
        method: MethodRef<'_>,
    ) -> Result<&MethodDescriptor, ResolveError> {
        let (service, method) = match (service, method) {
            (Some(service), method) => (self.service(service)?, method),
            (None, MethodRef::Name(name)) => match name.rsplit_once('.') {
                Some((service, method)) => (
                    self.service(ServiceRef::Name(service))?,
                    MethodRef::Name(method),
                ),
                None => (
                    self.services
                        .default_service()
                        .ok_or(ResolveError::NoDefaultService)?,
                    MethodRef::Name(name),
                ),
            },
            (None, MethodRef::Descriptor(descriptor)) => {
                let parent = descriptor
                    .parent()
                    .ok_or_else(|| ResolveError::OrphanMethod(descriptor.name().to_string()))?;
                (
                    self.service(ServiceRef::Name(parent))?,
                    MethodRef::Descriptor(descriptor),
                )
            }
        };

        match method {
            MethodRef::Name(name) => service.find_method(name).ok_or_else(|| {
                ResolveError::InvalidMethod(format!("{}.{name}", service.full_name()))
            }),
            MethodRef::Descriptor(descriptor) => service
                .methods()
                .iter()
                .find(|candidate| *candidate == descriptor)
                .ok_or_else(|| ResolveError::InvalidMethod(descriptor.full_name())),
        }
    }

    fn service(&self, service: ServiceRef<'_>) -> Result<&ServiceDescriptor, ResolveError> {
        let name = match service {
            ServiceRef::Name(name) => name,
            ServiceRef::Descriptor(descriptor) => descriptor.full_name(),
        };

        self.services
            .get(name)
            .ok_or_else(|| ResolveError::InvalidService(name.to_string()))
    }

    pub(crate) fn register(&self, method: &MethodDescriptor, handler: Arc<dyn ErasedHandler>) {
        self.handlers.write().insert(method.full_name(), handler);
    }

    /// Find the handler for an inbound request. An empty `service` means the
    /// default service.
    pub(crate) fn resolve(
        &self,
        service: &str,
        method: &str,
    ) -> Result<Arc<dyn ErasedHandler>, DispatchError> {
        let service = if service.is_empty() {
            self.services.default_service()
        } else {
            self.services.get(service)
        }
        .ok_or(DispatchError::InvalidService)?;

        let method = service
            .find_method(method)
            .ok_or(DispatchError::InvalidMethod)?;

        self.handlers
            .read()
            .get(&method.full_name())
            .cloned()
            .ok_or(DispatchError::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct TextMessage {
        #[prost(string, tag = "1")]
        text: String,
    }

    struct Noop;

    impl ErasedHandler for Noop {
        fn call(
            &self,
            payload: Bytes,
            _connection: Connection,
        ) -> BoxFuture<'static, Result<Bytes, DispatchError>> {
            future::ready(Ok(payload)).boxed()
        }
    }

    fn resolver() -> MethodResolver {
        MethodResolver::new(
            [
                ServiceDescriptor::new("TestService")
                    .method::<TextMessage, TextMessage>("Echo")
                    .method::<TextMessage, TextMessage>("Upper"),
                ServiceDescriptor::new("testNamespaceWithSameMethods.TestService")
                    .method::<TextMessage, TextMessage>("Upper"),
            ]
            .into_iter()
            .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_requires_services() {
        assert!(matches!(
            MethodResolver::new(Services::default()),
            Err(ResolveError::NoServices)
        ));

        let duplicated = [ServiceDescriptor::new("A"), ServiceDescriptor::new("A")]
            .into_iter()
            .collect();
        assert!(matches!(
            MethodResolver::new(duplicated),
            Err(ResolveError::DuplicateService(name)) if name == "A"
        ));
    }

    #[test]
    fn test_dotted_targets() {
        let resolver = resolver();

        let upper = resolver
            .target(None, MethodRef::Name("testNamespaceWithSameMethods.TestService.upper"))
            .unwrap();
        assert_eq!(
            upper.full_name(),
            "testNamespaceWithSameMethods.TestService.Upper"
        );

        let echo = resolver.target(None, MethodRef::Name("TestService.Echo")).unwrap();
        assert_eq!(echo.full_name(), "TestService.Echo");

        assert_eq!(
            resolver.target(None, MethodRef::Name("Echo")),
            Err(ResolveError::NoDefaultService)
        );
        assert_eq!(
            resolver.target(None, MethodRef::Name("Missing.Echo")),
            Err(ResolveError::InvalidService("Missing".to_string()))
        );
        assert_eq!(
            resolver.target(Some(ServiceRef::Name("TestService")), MethodRef::Name("Lower")),
            Err(ResolveError::InvalidMethod("TestService.Lower".to_string()))
        );
    }

    #[test]
    fn test_descriptor_targets() {
        let resolver = resolver();
        let packaged = resolver
            .services()
            .get("testNamespaceWithSameMethods.TestService")
            .unwrap()
            .clone();
        let upper = packaged.find_method("Upper").unwrap();

        assert_eq!(
            resolver.target(None, MethodRef::Descriptor(upper)).unwrap(),
            upper
        );

        // Belongs to the packaged service, not the root one
        assert!(matches!(
            resolver.target(Some(ServiceRef::Name("TestService")), MethodRef::Descriptor(upper)),
            Err(ResolveError::InvalidMethod(_))
        ));

        let orphan = MethodDescriptor::new::<TextMessage, TextMessage>("Loose");
        assert_eq!(
            resolver.target(None, MethodRef::Descriptor(&orphan)),
            Err(ResolveError::OrphanMethod("Loose".to_string()))
        );
    }

    #[test]
    fn test_resolve_inbound() {
        let resolver = resolver();
        let echo = resolver.target(None, MethodRef::Name("TestService.Echo")).unwrap().clone();
        resolver.register(&echo, Arc::new(Noop));

        assert!(resolver.resolve("TestService", "echo").is_ok());
        assert!(matches!(
            resolver.resolve("TestService", "Upper"),
            Err(DispatchError::NotImplemented)
        ));
        assert!(matches!(
            resolver.resolve("TestService", "Nope"),
            Err(DispatchError::InvalidMethod)
        ));
        assert!(matches!(
            resolver.resolve("Nope", "Echo"),
            Err(DispatchError::InvalidService)
        ));
        assert!(matches!(
            resolver.resolve("", "Echo"),
            Err(DispatchError::InvalidService)
        ));
    }

    #[test]
    fn test_same_method_name_in_two_services() {
        let resolver = resolver();
        let root = resolver.target(None, MethodRef::Name("TestService.Upper")).unwrap().clone();
        resolver.register(&root, Arc::new(Noop));

        assert!(resolver.resolve("TestService", "Upper").is_ok());
        assert!(matches!(
            resolver.resolve("testNamespaceWithSameMethods.TestService", "Upper"),
            Err(DispatchError::NotImplemented)
        ));
    }
}
