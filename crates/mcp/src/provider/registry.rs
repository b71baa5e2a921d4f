//! Named providers merged into one tool namespace.

use super::{ProviderError, ProviderKind, ToolProvider, Visibility};
use crate::handler::RequestContext;
use crate::protocol::{CallToolResult, ToolDescriptor};
use crate::session::{Attachment, SessionPhase};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

pub struct ProviderEntry {
    pub name: String,
    pub visibility: Visibility,
    pub provider: Arc<dyn ToolProvider>,
}

/// Snapshot of one provider for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub kind: ProviderKind,
    pub visibility: Visibility,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<SessionPhase>,
}

/// Route tables are kept per caller class: the providers an anonymous caller
/// can see differ from an authenticated one's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Scope {
    Anonymous,
    Authenticated,
}

impl Scope {
    fn of(ctx: &RequestContext) -> Self {
        if ctx.is_authenticated() {
            Self::Authenticated
        } else {
            Self::Anonymous
        }
    }
}

#[derive(Debug, Clone)]
struct Route {
    provider: usize,
    descriptor: ToolDescriptor,
}

/// Providers in configuration order. On a tool-name clash the earlier provider wins.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: Vec<Arc<ProviderEntry>>,
    routes: RwLock<HashMap<Scope, HashMap<String, Route>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        visibility: Visibility,
        provider: Arc<dyn ToolProvider>,
    ) {
        self.entries.push(Arc::new(ProviderEntry {
            name: name.into(),
            visibility,
            provider,
        }));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderEntry>> {
        self.entries.iter().find(|e| e.name == name).cloned()
    }

    /// A registry holding only `name`, sharing the provider itself.
    pub fn scoped(&self, name: &str) -> Option<ProviderRegistry> {
        let entry = self.get(name)?;
        Some(ProviderRegistry {
            entries: vec![entry],
            routes: RwLock::new(HashMap::new()),
        })
    }

    pub fn statuses(&self) -> Vec<ProviderStatus> {
        self.entries
            .iter()
            .map(|e| ProviderStatus {
                name: e.name.clone(),
                kind: e.provider.kind(),
                visibility: e.visibility,
                phase: e.provider.phase(),
            })
            .collect()
    }

    pub fn attachments(&self) -> Vec<Attachment> {
        self.entries
            .iter()
            .filter_map(|e| e.provider.attach())
            .collect()
    }

    /// Merged descriptors of every provider visible to the caller.
    ///
    /// Providers that fail are logged and skipped; only when all of them fail
    /// is the first failure returned.
    pub async fn list_tools(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<ToolDescriptor>, ProviderError> {
        let visible: Vec<(usize, &Arc<ProviderEntry>)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.visibility.allows(ctx))
            .collect();

        let listings = join_all(visible.iter().map(|(index, entry)| async move {
            (*index, entry.provider.list_tools(ctx).await)
        }))
        .await;

        let mut tools = Vec::new();
        let mut seen = HashSet::new();
        let mut fresh: HashMap<String, Route> = HashMap::new();
        let mut refreshed = HashSet::new();
        let mut first_error = None;

        for (index, listing) in listings {
            let provider = &self.entries[index].name;
            match listing {
                Ok(descriptors) => {
                    refreshed.insert(index);
                    for descriptor in descriptors {
                        if !seen.insert(descriptor.name.clone()) {
                            warn!(
                                %provider,
                                tool = %descriptor.name,
                                "Duplicate tool name, keeping the earlier provider's"
                            );
                            continue;
                        }
                        fresh.insert(
                            descriptor.name.clone(),
                            Route {
                                provider: index,
                                descriptor: descriptor.clone(),
                            },
                        );
                        tools.push(descriptor);
                    }
                }
                Err(e) => {
                    warn!(%provider, error = %e, "Provider failed to list tools");
                    first_error.get_or_insert(e);
                }
            }
        }

        if refreshed.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        if let Ok(mut routes) = self.routes.write() {
            let table = routes.entry(Scope::of(ctx)).or_default();
            table.retain(|_, route| !refreshed.contains(&route.provider));
            for (name, route) in fresh {
                // A surviving entry belongs to an earlier provider that failed this time.
                table.entry(name).or_insert(route);
            }
        }

        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        ctx: &RequestContext,
    ) -> Result<CallToolResult, ProviderError> {
        let route = match self.route(name, ctx) {
            Some(route) => route,
            None => {
                debug!(tool = %name, "Route cache miss, refreshing tool lists");
                self.list_tools(ctx).await?;
                self.route(name, ctx)
                    .ok_or_else(|| ProviderError::UnknownTool(name.to_string()))?
            }
        };

        let entry = &self.entries[route.provider];
        if !entry.visibility.allows(ctx) {
            return Err(ProviderError::UnknownTool(name.to_string()));
        }

        validate_arguments(&route.descriptor, &arguments)?;
        debug!(provider = %entry.name, tool = %name, "Calling tool");
        entry.provider.call_tool(name, arguments, ctx).await
    }

    fn route(&self, name: &str, ctx: &RequestContext) -> Option<Route> {
        self.routes.read().ok()?.get(&Scope::of(ctx))?.get(name).cloned()
    }
}

/// Only the descriptor's `required` list is enforced; `null` counts as absent.
pub(crate) fn validate_arguments(
    descriptor: &ToolDescriptor,
    arguments: &Value,
) -> Result<(), ProviderError> {
    let object = arguments
        .as_object()
        .ok_or_else(|| ProviderError::InvalidArguments("arguments must be an object".to_string()))?;

    let missing: Vec<String> = descriptor
        .required_arguments()
        .into_iter()
        .filter(|name| object.get(*name).map_or(true, Value::is_null))
        .map(str::to_string)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProviderError::MissingArguments(missing))
    }
}
