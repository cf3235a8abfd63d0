//! Service registration seams used by the worker request loop.
//!
//! The registry that maps a service name to a concrete object is an external
//! collaborator; these traits are its contract. The embedding worker binary
//! supplies a [`ServiceInitializer`] that populates a [`ServiceProvider`]
//! once per worker process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::bridge::protocol::RemoteError;

/// Method invocation failures a service reports back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Requested method '{method}' does not belong to service '{service}'")]
    MethodNotFound { service: String, method: String },

    #[error("{message}")]
    Failed {
        message: String,
        stack: Option<String>,
    },
}

impl InvokeError {
    pub fn method_not_found(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            service: service.into(),
            method: method.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            stack: None,
        }
    }

    pub fn failed_with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }

    pub(crate) fn into_remote(self) -> RemoteError {
        match self {
            Self::MethodNotFound { .. } => RemoteError::new(self.to_string()),
            Self::Failed { message, stack } => RemoteError { message, stack },
        }
    }
}

/// An invocable service living inside a worker.
///
/// Implementations dispatch on the method name themselves and report unknown
/// names with [`InvokeError::MethodNotFound`]; async methods are awaited
/// through the trait's own future.
#[async_trait]
pub trait Service: Send + Sync {
    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, InvokeError>;
}

/// Service initialization failures, reported back to the request that
/// triggered initialization.
#[derive(Debug, thiserror::Error)]
pub enum InitializerError {
    /// The initializer module or class could not be loaded.
    #[error("failed to load service initializer: {message}")]
    Load { message: String },

    /// The initializer ran but failed to register its services.
    #[error("service initialization failed: {message}")]
    Init { message: String },
}

impl InitializerError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    pub fn init(message: impl Into<String>) -> Self {
        Self::Init {
            message: message.into(),
        }
    }
}

/// User-supplied startup hook that registers services into the provider.
///
/// Runs at most once per worker process, lazily on the first request; a
/// failure is reported to that request and a later request retries.
#[async_trait]
pub trait ServiceInitializer: Send + Sync {
    async fn initialize(&self, provider: &mut ServiceProvider) -> Result<(), InitializerError>;
}

/// Wrap a synchronous registration closure as a [`ServiceInitializer`].
pub struct FnInitializer<F>(pub F);

#[async_trait]
impl<F> ServiceInitializer for FnInitializer<F>
where
    F: Fn(&mut ServiceProvider) -> Result<(), InitializerError> + Send + Sync,
{
    async fn initialize(&self, provider: &mut ServiceProvider) -> Result<(), InitializerError> {
        (self.0)(provider)
    }
}

/// Worker-local registry from service name (+ optional scope) to service.
#[derive(Default)]
pub struct ServiceProvider {
    services: HashMap<(String, Option<String>), Arc<dyn Service>>,
}

impl ServiceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, service: Arc<dyn Service>) {
        self.services.insert((name.into(), None), service);
    }

    pub fn register_scoped(
        &mut self,
        name: impl Into<String>,
        scope: impl Into<String>,
        service: Arc<dyn Service>,
    ) {
        self.services
            .insert((name.into(), Some(scope.into())), service);
    }

    /// Scope semantics are owned by the registrant; the name/scope pair is
    /// matched verbatim.
    pub fn get_by_name(&self, name: &str, scope: Option<&str>) -> Option<Arc<dyn Service>> {
        self.services
            .get(&(name.to_string(), scope.map(String::from)))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoService;

    #[async_trait]
    impl Service for EchoService {
        async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, InvokeError> {
            match method {
                "echo" => Ok(arguments.into_iter().next().unwrap_or(Value::Null)),
                other => Err(InvokeError::method_not_found("echo", other)),
            }
        }
    }

    #[tokio::test]
    async fn registered_service_is_resolvable_and_invocable() {
        let mut provider = ServiceProvider::new();
        provider.register("echo", Arc::new(EchoService));

        let service = provider.get_by_name("echo", None).unwrap();
        let result = service.invoke("echo", vec![json!("hello")]).await.unwrap();
        assert_eq!(result, json!("hello"));
    }

    #[test]
    fn scoped_and_unscoped_registrations_are_distinct() {
        let mut provider = ServiceProvider::new();
        provider.register("echo", Arc::new(EchoService));
        provider.register_scoped("echo", "tenant-a", Arc::new(EchoService));

        assert!(provider.get_by_name("echo", None).is_some());
        assert!(provider.get_by_name("echo", Some("tenant-a")).is_some());
        assert!(provider.get_by_name("echo", Some("tenant-b")).is_none());
        assert_eq!(provider.len(), 2);
    }

    #[test]
    fn method_not_found_names_method_and_service() {
        let error = InvokeError::method_not_found("catalog", "does_not_exist");
        let message = error.to_string();
        assert!(message.contains("does_not_exist"));
        assert!(message.contains("catalog"));
    }

    #[test]
    fn invoke_error_flattens_to_remote_error() {
        let remote = InvokeError::failed_with_stack("boom", "at lib.rs:7").into_remote();
        assert_eq!(remote.message, "boom");
        assert_eq!(remote.stack.as_deref(), Some("at lib.rs:7"));
    }

    #[tokio::test]
    async fn fn_initializer_registers_services() {
        let initializer =
            FnInitializer(|provider: &mut ServiceProvider| -> Result<(), InitializerError> {
                provider.register("echo", Arc::new(EchoService));
                Ok(())
            });

        let mut provider = ServiceProvider::new();
        initializer.initialize(&mut provider).await.unwrap();
        assert!(provider.get_by_name("echo", None).is_some());
    }
}
