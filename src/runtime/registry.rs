//! Name-keyed handler registries for workflows and activities.
//!
//! Both use the same `Registry<H>` shape: an immutable map built once through a
//! builder and shared by the dispatchers.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};

use super::activity::{ActivityContext, ActivityError, ActivityHandler, FnActivity};
use super::{FnWorkflow, WorkflowHandler};
use crate::_typed_codec::{Codec, Json};
use crate::OrchestrationContext;

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

pub type WorkflowRegistry = Registry<dyn WorkflowHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type WorkflowRegistryBuilder = RegistryBuilder<dyn WorkflowHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn builder_from(reg: &Registry<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            map: reg.inner.as_ref().clone(),
            errors: Vec::new(),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<H>> {
        let found = self.inner.get(name).cloned();
        if found.is_none() {
            tracing::debug!(
                target: "content_amplifier::registry",
                name = %name,
                registered = ?self.list_names(),
                "registry miss"
            );
        }
        found
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<H>) -> Self {
        let name = name.into();
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate registration: {name}"));
        } else {
            self.map.insert(name, handler);
        }
        self
    }

    /// Finalize; duplicate registrations keep the first handler.
    pub fn build(self) -> Registry<H> {
        for e in &self.errors {
            tracing::warn!(target: "content_amplifier::registry", "{e}");
        }
        Registry {
            inner: Arc::new(self.map),
        }
    }

    /// Finalize, failing on any duplicate registration.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(Registry {
                inner: Arc::new(self.map),
            })
        } else {
            Err(self.errors.join("; "))
        }
    }
}

impl RegistryBuilder<dyn WorkflowHandler> {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_handler(name, Arc::new(FnWorkflow(f)))
    }

    /// Register a workflow with JSON-typed input and output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |ctx, input: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = Json::decode(&input).map_err(|e| format!("decode workflow input: {e}"))?;
                let out = f(ctx, input).await?;
                Json::encode(&out).map_err(|e| format!("encode workflow output: {e}"))
            }
        })
    }
}

impl RegistryBuilder<dyn ActivityHandler> {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        self.register_handler(name, Arc::new(FnActivity(f)))
    }

    /// Register an activity with JSON-typed input and output. Payloads that do
    /// not decode are rejected as non-retryable.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, ActivityError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |ctx, input: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In =
                    Json::decode(&input).map_err(|e| ActivityError::non_retryable(format!("decode input: {e}")))?;
                let out = f(ctx, input).await?;
                Json::encode(&out).map_err(|e| ActivityError::non_retryable(format!("encode output: {e}")))
            }
        })
    }
}
