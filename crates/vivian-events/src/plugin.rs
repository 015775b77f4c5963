//! Event plugins: components that register their own handlers.
//!
//! A plugin declares what it listens to through [`EventPlugin::handlers`];
//! the bus wires them up in [`EventBus::register_plugin`].

use std::collections::BTreeSet;

use crate::bus::{EventBus, Handler, SubscriptionId};
use vivian_core::Result;

/// What a plugin subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSelector {
    Exact(String),
    Once(String),
    Pattern(String),
    Global,
}

/// The kinds of subscription a plugin uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PluginCapability {
    ExactEvents,
    OneShotEvents,
    PatternEvents,
    GlobalObserver,
}

impl EventSelector {
    pub fn capability(&self) -> PluginCapability {
        match self {
            EventSelector::Exact(_) => PluginCapability::ExactEvents,
            EventSelector::Once(_) => PluginCapability::OneShotEvents,
            EventSelector::Pattern(_) => PluginCapability::PatternEvents,
            EventSelector::Global => PluginCapability::GlobalObserver,
        }
    }
}

/// One handler declared by a plugin.
pub struct HandlerSpec {
    pub selector: EventSelector,
    pub handler: Handler,
}

impl HandlerSpec {
    pub fn new<F>(selector: EventSelector, handler: F) -> Self
    where
        F: Fn(&crate::Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            selector,
            handler: std::sync::Arc::new(handler),
        }
    }
}

pub trait EventPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn handlers(&self) -> Vec<HandlerSpec>;

    fn capabilities(&self) -> BTreeSet<PluginCapability> {
        self.handlers().iter().map(|h| h.selector.capability()).collect()
    }
}

impl EventBus {
    /// Subscribe every handler a plugin declares. Nothing is registered if
    /// one of its patterns fails to compile.
    pub fn register_plugin(&self, plugin: &dyn EventPlugin) -> Result<Vec<SubscriptionId>> {
        let specs = plugin.handlers();

        // Validate patterns before registering anything.
        for spec in &specs {
            if let EventSelector::Pattern(p) = &spec.selector {
                regex::Regex::new(p).map_err(|e| vivian_core::VivianError::Pattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let handler = spec.handler;
            let call = move |e: &crate::Event| handler(e);
            let id = match &spec.selector {
                EventSelector::Exact(et) => self.subscribe(et, call),
                EventSelector::Once(et) => self.subscribe_once(et, call),
                EventSelector::Pattern(p) => self.subscribe_pattern(p, call)?,
                EventSelector::Global => self.subscribe_global(call),
            };
            ids.push(id);
        }
        tracing::info!("🔌 Plugin '{}' registered {} handler(s)", plugin.name(), ids.len());
        Ok(ids)
    }

    /// Register each plugin in order, stopping at the first failure.
    pub fn register_plugins(
        &self,
        plugins: &[Box<dyn EventPlugin>],
    ) -> Result<Vec<SubscriptionId>> {
        let mut ids = Vec::new();
        for plugin in plugins {
            ids.extend(self.register_plugin(plugin.as_ref())?);
        }
        Ok(ids)
    }
}
