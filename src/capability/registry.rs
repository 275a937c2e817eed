//! Capability whitelist.
//!
//! Built once at startup, then frozen behind an `Arc` and handed to each
//! engine. Both engines dispatch through [`CapabilityRegistry::invoke`].

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::Value;
use tracing::debug;

use super::Capability;
use crate::error::CapabilityError;

#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a capability to the whitelist.
    ///
    /// Names must be identifiers valid in both expression languages and
    /// unique within the registry.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<()> {
        let name = capability.name().to_string();
        if !is_identifier(&name) {
            bail!("capability name '{name}' is not a valid identifier");
        }
        if self.capabilities.contains_key(&name) {
            bail!("capability '{name}' is already registered");
        }
        self.capabilities.insert(name, capability);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.capabilities.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Capability>)> {
        self.capabilities.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Calls a whitelisted capability on behalf of an evaluation.
    ///
    /// Refuses to start the call if the evaluation running on this thread
    /// has already been abandoned by its caller.
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Value, CapabilityError> {
        if current_evaluation_abandoned() {
            debug!("refusing call to '{name}': evaluation abandoned");
            return Err(CapabilityError::Abandoned);
        }
        let capability = self
            .capabilities
            .get(name)
            .ok_or_else(|| CapabilityError::Unknown(name.to_string()))?;
        debug!("calling capability '{name}' with {} args", args.len());
        capability.call(args)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ── Abandonment ──────────────────────────────────────────

thread_local! {
    static CURRENT_EVALUATION: RefCell<Option<Arc<AtomicBool>>> = const { RefCell::new(None) };
}

fn current_evaluation_abandoned() -> bool {
    CURRENT_EVALUATION.with(|slot| {
        slot.borrow()
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    })
}

/// Binds an abandonment flag to the current thread for the lifetime of the guard.
///
/// Evaluations run synchronously on a blocking thread, so every capability
/// call they make happens on the thread that entered the guard.
pub(crate) struct EvaluationGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl EvaluationGuard {
    pub(crate) fn enter(abandoned: Arc<AtomicBool>) -> Self {
        CURRENT_EVALUATION.with(|slot| *slot.borrow_mut() = Some(abandoned));
        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for EvaluationGuard {
    fn drop(&mut self) {
        CURRENT_EVALUATION.with(|slot| *slot.borrow_mut() = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::FnCapability;
    use serde_json::json;

    fn echo(name: &str) -> Arc<dyn Capability> {
        Arc::new(FnCapability::new(name, |args: &[Value]| {
            Ok(Value::Array(args.to_vec()))
        }))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = CapabilityRegistry::new();
        registry.register(echo("echo")).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.contains("echo"));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["echo"]);
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = CapabilityRegistry::new();
        registry.register(echo("echo")).unwrap();
        let err = registry.register(echo("echo")).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_register_rejects_non_identifiers() {
        let mut registry = CapabilityRegistry::new();
        for bad in ["", "1abc", "http-get", "a.b", "with space"] {
            assert!(registry.register(echo(bad)).is_err(), "{bad:?} accepted");
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invoke_unknown() {
        let registry = CapabilityRegistry::new();
        assert_eq!(
            registry.invoke("missing", &[]).unwrap_err(),
            CapabilityError::Unknown("missing".into())
        );
    }

    #[test]
    fn test_invoke_passes_args() {
        let mut registry = CapabilityRegistry::new();
        registry.register(echo("echo")).unwrap();
        let out = registry.invoke("echo", &[json!(1), json!({"a": [true]})]).unwrap();
        assert_eq!(out, json!([1, {"a": [true]}]));
    }

    #[test]
    fn test_invoke_refused_once_abandoned() {
        let mut registry = CapabilityRegistry::new();
        registry.register(echo("echo")).unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let guard = EvaluationGuard::enter(flag.clone());
        assert!(registry.invoke("echo", &[]).is_ok());

        flag.store(true, Ordering::Release);
        assert_eq!(
            registry.invoke("echo", &[]).unwrap_err(),
            CapabilityError::Abandoned
        );

        // Leaving the evaluation clears the flag for this thread
        drop(guard);
        assert!(registry.invoke("echo", &[]).is_ok());
    }
}
