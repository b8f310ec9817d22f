use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Encoding;
use crate::errors::{DispatchError, Error};

/// The error type service method handlers return; the display text is what
/// the caller sees.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// One callable method of a registered service.
///
/// The concrete argument and reply types are erased behind a trampoline
/// that deserializes the request body, invokes the handler with the
/// receiver bound, and serializes the reply.
pub struct MethodDescriptor {
    num_calls: Arc<AtomicU64>,
    trampoline: Box<dyn Fn(Encoding, &[u8]) -> Result<Vec<u8>, DispatchError> + Send + Sync>,
}

impl MethodDescriptor {
    /// How many times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    pub(crate) fn invoke(&self, encoding: Encoding, body: &[u8]) -> Result<Vec<u8>, DispatchError> {
        (self.trampoline)(encoding, body)
    }
}

/// A registered receiver and its remotely callable methods.
pub struct Service {
    name: String,
    methods: HashMap<String, MethodDescriptor>,
}

impl Service {
    /// The service name: the receiver's type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method descriptor by name.
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    pub(crate) fn dispatch(
        &self,
        method: &str,
        encoding: Encoding,
        body: &[u8],
    ) -> Result<Vec<u8>, DispatchError> {
        let descriptor = self
            .method(method)
            .ok_or_else(|| DispatchError::MethodNotFound(method.to_owned()))?;
        descriptor.invoke(encoding, body)
    }
}

/// Builds a [`Service`] from a receiver and its typed method handlers.
///
/// Handler signatures mirror the remote calling convention: the receiver,
/// an owned argument, and a mutable reply slot that starts out as the
/// reply type's default (containers start empty, so a handler may insert
/// without any initialization of its own).
pub struct ServiceBuilder<T> {
    name: String,
    receiver: Arc<T>,
    methods: HashMap<String, MethodDescriptor>,
}

impl<T: Send + Sync + 'static> ServiceBuilder<T> {
    /// Start building a service; the service name is the receiver's type
    /// name, which must be exported (begin with an uppercase letter).
    pub fn new(receiver: T) -> Result<Self, Error> {
        let name = short_type_name::<T>();
        if !is_exported(name) {
            return Err(Error::InvalidService(name.to_owned()));
        }
        Ok(ServiceBuilder {
            name: name.to_owned(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
        })
    }

    /// Register one method under `name`.
    ///
    /// The method name and the argument/reply type names must be exported
    /// or built-in; ineligible methods are skipped, mirroring how a
    /// reflective registry would never enumerate them.
    pub fn method<A, R, F>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        F: Fn(&T, A, &mut R) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        if !is_exported(name) {
            warn!("rpc server: skipping unexported method {}.{}", self.name, name);
            return self;
        }
        if !is_exported_or_builtin::<A>() || !is_exported_or_builtin::<R>() {
            warn!(
                "rpc server: skipping method {}.{}: argument and reply types must be exported or built-in",
                self.name, name
            );
            return self;
        }
        if self.methods.contains_key(name) {
            warn!("rpc server: method {}.{} registered twice", self.name, name);
            return self;
        }

        let receiver = self.receiver.clone();
        let num_calls = Arc::new(AtomicU64::new(0));
        let counter = num_calls.clone();
        let trampoline = move |encoding: Encoding, body: &[u8]| -> Result<Vec<u8>, DispatchError> {
            let arg: A = encoding
                .decode(body)
                .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
            counter.fetch_add(1, Ordering::Relaxed);
            let mut reply = R::default();
            handler(&receiver, arg, &mut reply).map_err(|e| DispatchError::Handler(e.to_string()))?;
            encoding
                .encode(&reply)
                .map_err(|e| DispatchError::Serialize(e.to_string()))
        };

        info!("rpc server: register {}.{}", self.name, name);
        self.methods.insert(
            name.to_owned(),
            MethodDescriptor {
                num_calls,
                trampoline: Box::new(trampoline),
            },
        );
        self
    }

    /// Finish the build.
    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

/// Split a `"Service.Method"` identifier on its last `.`.
pub(crate) fn split_service_method(service_method: &str) -> Result<(&str, &str), DispatchError> {
    service_method
        .rsplit_once('.')
        .ok_or_else(|| DispatchError::IllFormed(service_method.to_owned()))
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

fn is_exported_or_builtin<T>() -> bool {
    let full = std::any::type_name::<T>();
    !full.contains("::") || is_exported(short_type_name::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;

    fn counter_service() -> Service {
        ServiceBuilder::new(Counter)
            .unwrap()
            .method("Sum", |_: &Counter, args: (i64, i64), reply: &mut i64| {
                *reply = args.0 + args.1;
                Ok(())
            })
            .build()
    }

    #[test]
    fn service_name_is_receiver_type_name() {
        assert_eq!(counter_service().name(), "Counter");
    }

    #[test]
    fn unexported_receiver_is_rejected() {
        #[allow(non_camel_case_types)]
        struct lower_case;
        assert!(matches!(
            ServiceBuilder::new(lower_case),
            Err(Error::InvalidService(_))
        ));
    }

    #[test]
    fn unexported_method_is_skipped() {
        let service = ServiceBuilder::new(Counter)
            .unwrap()
            .method("sum", |_: &Counter, _: (i64, i64), _: &mut i64| Ok(()))
            .build();
        assert!(service.method("sum").is_none());
    }

    #[test]
    fn dispatch_runs_handler_and_counts() {
        let service = counter_service();
        let encoding = Encoding::Binary;
        let body = encoding.encode(&(1i64, 3i64)).unwrap();

        let reply = service.dispatch("Sum", encoding, &body).unwrap();
        let reply: i64 = encoding.decode(&reply).unwrap();
        assert_eq!(reply, 4);
        assert_eq!(service.method("Sum").unwrap().num_calls(), 1);
    }

    #[test]
    fn dispatch_unknown_method_fails() {
        let err = counter_service()
            .dispatch("Mul", Encoding::Binary, &[])
            .unwrap_err();
        assert!(err.to_string().contains("can't find method Mul"));
    }

    #[test]
    fn dispatch_bad_body_is_deserialize_error() {
        let service = counter_service();
        let err = service
            .dispatch("Sum", Encoding::Json, b"{not json")
            .unwrap_err();
        assert!(matches!(err, DispatchError::Deserialize(_)));
        // a request that never reached the handler is not counted
        assert_eq!(service.method("Sum").unwrap().num_calls(), 0);
    }

    #[test]
    fn handler_error_text_is_preserved() {
        struct Failing;
        let service = ServiceBuilder::new(Failing)
            .unwrap()
            .method("Boom", |_: &Failing, _: u32, _: &mut u32| Err("boom".into()))
            .build();
        let body = Encoding::Binary.encode(&7u32).unwrap();
        let err = service.dispatch("Boom", Encoding::Binary, &body).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn container_reply_starts_empty() {
        struct Lister;
        let service = ServiceBuilder::new(Lister)
            .unwrap()
            .method("Pad", |_: &Lister, n: u32, reply: &mut Vec<u32>| {
                assert!(reply.is_empty());
                reply.extend(0..n);
                Ok(())
            })
            .build();
        let body = Encoding::Binary.encode(&3u32).unwrap();
        let reply = service.dispatch("Pad", Encoding::Binary, &body).unwrap();
        let reply: Vec<u32> = Encoding::Binary.decode(&reply).unwrap();
        assert_eq!(reply, vec![0, 1, 2]);
    }

    #[test]
    fn split_on_last_dot() {
        assert_eq!(split_service_method("Foo.Sum").unwrap(), ("Foo", "Sum"));
        assert_eq!(split_service_method("a.b.C").unwrap(), ("a.b", "C"));
        assert!(split_service_method("FooSum").is_err());
    }
}
