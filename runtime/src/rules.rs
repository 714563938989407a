//! Merged view over static and control-plane rules.
//!
//! The merged [`RuleSet`] is computed lazily and cached until the next
//! change notification from the source. Any change anywhere clears the
//! whole cache; there is no TTL.

use std::sync::Arc;

use jitreg_core::event::{events, EventEmitter, GatewayEvent};
use jitreg_core::{Rule, RuleSet};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

use crate::source::{wait_for_shutdown, RuleSource, WatchEvent};

/// Static rules merged with rules sourced from a live control plane.
pub struct DynamicRules {
    statics: Arc<RuleSet>,
    source: Option<Arc<dyn RuleSource>>,
    merged: Mutex<Option<Arc<RuleSet>>>,
    events: EventEmitter,
}

impl DynamicRules {
    /// Rules fixed at startup, with no control plane.
    pub fn static_only(statics: RuleSet) -> Self {
        Self::new(statics, None, EventEmitter::default())
    }

    pub fn new(
        statics: RuleSet,
        source: Option<Arc<dyn RuleSource>>,
        events: EventEmitter,
    ) -> Self {
        Self {
            statics: Arc::new(statics),
            source,
            merged: Mutex::new(None),
            events,
        }
    }

    /// The control plane, if one is configured.
    pub fn source(&self) -> Option<&Arc<dyn RuleSource>> {
        self.source.as_ref()
    }

    /// Whether a merged rule set is currently cached.
    pub fn is_cached(&self) -> bool {
        self.merged.lock().is_some()
    }

    /// Drop the cached merged rule set.
    pub fn invalidate(&self) {
        *self.merged.lock() = None;
        self.events.emit(GatewayEvent::empty(events::RULES_INVALIDATED));
    }

    /// Current rules in precedence order.
    pub fn resolve(&self) -> Arc<RuleSet> {
        let Some(source) = &self.source else {
            return Arc::clone(&self.statics);
        };

        let mut merged = self.merged.lock();
        if let Some(rules) = merged.as_ref() {
            return Arc::clone(rules);
        }

        let objects = source.list();
        let mut rules: Vec<Arc<Rule>> = Vec::with_capacity(self.statics.len() + objects.len());
        rules.extend(self.statics.rules().iter().cloned());
        for object in &objects {
            match Rule::new(&object.spec) {
                Ok(rule) => rules.push(Arc::new(rule)),
                Err(e) => {
                    tracing::error!(
                        name = %object.metadata.name,
                        error = %e,
                        "Skipping Image object that does not convert to a rule"
                    );
                }
            }
        }

        let rules = Arc::new(RuleSet::new(rules));
        *merged = Some(Arc::clone(&rules));
        drop(merged);

        tracing::debug!(
            statics = self.statics.len(),
            total = rules.len(),
            "Rebuilt merged rule set"
        );
        self.events.emit(GatewayEvent::empty(events::RULES_REBUILT));
        rules
    }

    /// Invalidate on every change notification until shutdown.
    ///
    /// A lagged receiver has missed changes, so it invalidates too.
    pub async fn watch(
        &self,
        mut changes: broadcast::Receiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                received = changes.recv() => match received {
                    Ok(event) => {
                        tracing::debug!(event = ?event, "Control-plane change, invalidating rules");
                        self.invalidate();
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Rule change stream lagged, invalidating rules");
                        self.invalidate();
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }
}
