use std::fmt;

use prost_types::{DescriptorProto, FieldDescriptorProto, MethodDescriptorProto, ServiceDescriptorProto};
use rama::utils::macros::generate_set_and_with;

/// A single grpc-web call: the resolved service and method,
/// the input message to send and the output message to decode into.
///
/// The descriptors are resolved by the caller (e.g. from a file descriptor set),
/// this crate only reads names and the output field list from them.
#[derive(Debug, Clone)]
pub struct Request<I, O> {
    service: ServiceDescriptorProto,
    method: MethodDescriptorProto,
    output_descriptor: DescriptorProto,
    endpoint: String,
    input: I,
    output: O,
}

impl<I, O> Request<I, O> {
    /// Create a new [`Request`] for the method with the given name,
    /// which has to be defined by the given service.
    ///
    /// The endpoint path is derived as `/<service>/<method>`,
    /// use [`Request::with_package`] for services defined in a proto package.
    pub fn new(
        service: ServiceDescriptorProto,
        method_name: &str,
        output_descriptor: DescriptorProto,
        input: I,
        output: O,
    ) -> Result<Self, UnknownMethod> {
        let method = service
            .method
            .iter()
            .find(|m| m.name() == method_name)
            .cloned()
            .ok_or_else(|| UnknownMethod {
                service: service.name().to_owned(),
                method: method_name.to_owned(),
            })?;

        let endpoint = format!("/{}/{}", service.name(), method.name());
        Ok(Self {
            service,
            method,
            output_descriptor,
            endpoint,
            input,
            output,
        })
    }

    generate_set_and_with! {
        /// Set the proto package the service is declared in,
        /// such that the endpoint becomes `/<package>.<service>/<method>`.
        pub fn package(mut self, package: &str) -> Self {
            self.endpoint = if package.is_empty() {
                format!("/{}/{}", self.service.name(), self.method.name())
            } else {
                format!("/{package}.{}/{}", self.service.name(), self.method.name())
            };
            self
        }
    }

    /// Name of the service.
    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    /// Name of the method.
    pub fn method_name(&self) -> &str {
        self.method.name()
    }

    /// Descriptor of the method.
    pub fn method(&self) -> &MethodDescriptorProto {
        &self.method
    }

    /// Returns `true` if the method is declared as server streaming.
    pub fn is_server_streaming(&self) -> bool {
        self.method.server_streaming()
    }

    /// Http path of the method, e.g. `/helloworld.Greeter/SayHello`.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The message sent to the server.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// The last decoded response message.
    pub fn output(&self) -> &O {
        &self.output
    }

    /// Mutable access to the response message.
    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    /// Consume the request into its response message.
    pub fn into_output(self) -> O {
        self.output
    }

    /// Fields of the output message.
    pub fn output_fields(&self) -> &[FieldDescriptorProto] {
        &self.output_descriptor.field
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Error returned by [`Request::new`] when the service
/// does not define the requested method.
pub struct UnknownMethod {
    service: String,
    method: String,
}

impl fmt::Display for UnknownMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service {} does not define method {}",
            self.service, self.method
        )
    }
}

impl std::error::Error for UnknownMethod {}
