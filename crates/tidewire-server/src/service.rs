//! Service handlers and the `Service.method` routing table

use crate::session::Session;
use crate::{Result, ServerError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Handler for one service method
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Handle a call and return its result body
    async fn call(&self, session: &Session, params: Vec<Value>) -> anyhow::Result<Value>;
}

/// Resolves `(service, method)` to a handler
pub trait HandlerResolver: Send + Sync {
    /// Look up the handler, `None` if the method does not exist
    fn resolve(&self, service: &str, method: &str) -> Option<Arc<dyn ServiceHandler>>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ServiceHandler for FnHandler<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, _session: &Session, params: Vec<Value>) -> anyhow::Result<Value> {
        (self.f)(params).await
    }
}

/// Wrap an async closure over the call parameters as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ServiceHandler>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Routing table built and validated at registration time
#[derive(Default)]
pub struct ServiceTable {
    services: HashMap<String, HashMap<String, Arc<dyn ServiceHandler>>>,
}

impl ServiceTable {
    /// Start building a table
    pub fn builder() -> ServiceTableBuilder {
        ServiceTableBuilder::default()
    }

    /// Every registered `Service.method`, sorted
    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self
            .services
            .iter()
            .flat_map(|(service, methods)| {
                methods
                    .keys()
                    .map(move |method| tidewire_proto::command::method_command(service, method))
            })
            .collect();
        routes.sort();
        routes
    }

    /// Number of registered methods
    pub fn len(&self) -> usize {
        self.services.values().map(HashMap::len).sum()
    }

    /// Check if no method is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HandlerResolver for ServiceTable {
    fn resolve(&self, service: &str, method: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.services.get(service)?.get(method).cloned()
    }
}

/// Builder for [`ServiceTable`]
#[derive(Default)]
pub struct ServiceTableBuilder {
    services: BTreeMap<String, Vec<(String, Arc<dyn ServiceHandler>)>>,
}

impl ServiceTableBuilder {
    /// Add a method to a service
    pub fn method(
        mut self,
        service: impl Into<String>,
        method: impl Into<String>,
        handler: Arc<dyn ServiceHandler>,
    ) -> Self {
        self.services
            .entry(service.into())
            .or_default()
            .push((method.into(), handler));
        self
    }

    /// Validate names and build the table
    pub fn build(self) -> Result<ServiceTable> {
        let mut services = HashMap::new();

        for (service, methods) in self.services {
            validate_name("service", &service)?;
            let mut table: HashMap<String, Arc<dyn ServiceHandler>> = HashMap::new();

            for (method, handler) in methods {
                validate_name("method", &method)?;
                if table.insert(method.clone(), handler).is_some() {
                    return Err(ServerError::Registration(format!(
                        "method {}.{} registered twice",
                        service, method
                    )));
                }
                debug!("Registered handler for {}.{}", service, method);
            }
            services.insert(service, table);
        }

        Ok(ServiceTable { services })
    }
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ServerError::Registration(format!("{} name is empty", kind)));
    }
    if name.contains('.') || name.chars().any(char::is_whitespace) {
        return Err(ServerError::Registration(format!(
            "{} name '{}' must not contain dots or whitespace",
            kind, name
        )));
    }
    Ok(())
}
