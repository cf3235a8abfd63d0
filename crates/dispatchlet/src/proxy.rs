//! Typed service stubs over the dispatch path.
//!
//! `proxy.invoke("foo", args)` is exactly
//! `dispatch(DispatchTask { service, method: "foo", arguments: args })`; the
//! proxy adds nothing but the service identity, the scope, and result
//! decoding.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::dispatcher::{DispatchTask, Dispatcher};
use crate::error::DispatcherError;

pub struct ServiceProxy {
    dispatcher: Arc<Dispatcher>,
    service_name: String,
    scope: Option<String>,
}

impl ServiceProxy {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        service_name: impl Into<String>,
        scope: Option<String>,
    ) -> Self {
        Self {
            dispatcher,
            service_name: service_name.into(),
            scope,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Invoke a method, returning the raw JSON result. Argument order is
    /// preserved verbatim.
    pub async fn invoke_raw(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<Value, DispatcherError> {
        let mut task =
            DispatchTask::named(&self.service_name, method).with_arguments(arguments);
        if let Some(scope) = &self.scope {
            task = task.with_scope(scope.clone());
        }
        self.dispatcher.dispatch(task).await
    }

    /// Invoke a method and decode the result into `T`.
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<T, DispatcherError> {
        let value = self.invoke_raw(method, arguments).await?;
        serde_json::from_value(value).map_err(|e| {
            DispatcherError::Communication(format!("failed to decode dispatch result: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::ServiceDescriptor;
    use crate::options::DispatcherOptions;

    struct EchoDescriptor;

    impl ServiceDescriptor for EchoDescriptor {
        const SERVICE_NAME: &'static str = "echo";
    }

    #[tokio::test]
    async fn proxy_carries_service_name_and_scope() {
        let dispatcher =
            Dispatcher::create_instance(DispatcherOptions::new("/tmp")).unwrap();
        let proxy = dispatcher.get::<EchoDescriptor>(Some("tenant-a"));

        assert_eq!(proxy.service_name(), "echo");
        assert_eq!(proxy.scope(), Some("tenant-a"));
    }

    #[tokio::test]
    async fn proxy_invoke_rejects_when_not_started() {
        let dispatcher =
            Dispatcher::create_instance(DispatcherOptions::new("/tmp")).unwrap();
        let proxy = dispatcher.get::<EchoDescriptor>(None);

        let result: Result<Value, _> = proxy.invoke("echo", vec![]).await;
        assert!(matches!(result, Err(DispatcherError::NotStarted)));
    }
}
