//! Callable views of a service.

use bytes::Bytes;

use super::Client;
use crate::codec;
use crate::error::ClientError;
use crate::service::{MethodDescriptor, ServiceDescriptor, TypeDescriptor};

/// Calls methods of one service through a [`Client`].
#[derive(Debug, Clone, Copy)]
pub struct ServiceStub<'a> {
    client: &'a Client,
    descriptor: &'a ServiceDescriptor,
}

impl<'a> ServiceStub<'a> {
    pub(crate) const fn new(client: &'a Client, descriptor: &'a ServiceDescriptor) -> Self {
        Self { client, descriptor }
    }

    /// The service's full name.
    #[must_use]
    pub fn name(&self) -> &'a str {
        self.descriptor.full_name()
    }

    /// The service's descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> &'a ServiceDescriptor {
        self.descriptor
    }

    /// Call `method` with a typed request.
    ///
    /// # Errors
    ///
    /// Fails if the method is unknown or typed differently, and with any
    /// error of [`Client::call`].
    pub async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, ClientError>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static,
    {
        let method = self.method(method)?;
        check_type(method, method.request_type(), TypeDescriptor::of::<Req>())?;
        check_type(method, method.response_type(), TypeDescriptor::of::<Resp>())?;

        let response = self
            .client
            .call(self.name(), method.name(), codec::encode(request))
            .await?;

        Ok(codec::decode(&response)?)
    }

    /// Call `method` with an already encoded request.
    ///
    /// # Errors
    ///
    /// Fails if the method is unknown, and with any error of [`Client::call`].
    pub async fn call_raw(&self, method: &str, payload: Bytes) -> Result<Bytes, ClientError> {
        let method = self.method(method)?;
        self.client.call(self.name(), method.name(), payload).await
    }

    fn method(&self, name: &str) -> Result<&'a MethodDescriptor, ClientError> {
        self.descriptor
            .find_method(name)
            .ok_or_else(|| ClientError::UnknownMethod(format!("{}.{name}", self.name())))
    }
}

fn check_type(
    method: &MethodDescriptor,
    expected: TypeDescriptor,
    actual: TypeDescriptor,
) -> Result<(), ClientError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ClientError::TypeMismatch {
            method: method.full_name(),
            expected: expected.name(),
            actual: actual.name(),
        })
    }
}
