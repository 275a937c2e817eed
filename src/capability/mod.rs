pub mod builtin;
pub mod registry;

use serde_json::Value;

use crate::error::CapabilityError;

/// A host function that sandboxed expressions may call.
///
/// Capabilities are the only way an expression touches the outside world.
/// They are registered once at startup and shared read-only by every
/// evaluation, so implementations must tolerate concurrent calls.
///
/// `call` receives the untyped argument list exactly as the expression
/// passed it. Malformed input must come back as a [`CapabilityError`],
/// never as a panic.
pub trait Capability: Send + Sync {
    /// Identifier the expression uses to call this capability (e.g. `httpGet`).
    fn name(&self) -> &str;

    /// One-line summary, logged at startup.
    fn description(&self) -> &str;

    /// Runs the capability.
    ///
    /// Called from the evaluation's blocking thread, never from an async task.
    fn call(&self, args: &[Value]) -> Result<Value, CapabilityError>;
}

/// Adapts a plain closure into a [`Capability`].
pub struct FnCapability<F> {
    name: String,
    description: String,
    func: F,
}

impl<F> FnCapability<F>
where
    F: Fn(&[Value]) -> Result<Value, CapabilityError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            func,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl<F> Capability for FnCapability<F>
where
    F: Fn(&[Value]) -> Result<Value, CapabilityError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn call(&self, args: &[Value]) -> Result<Value, CapabilityError> {
        (self.func)(args)
    }
}

pub use registry::CapabilityRegistry;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capability_is_object_safe() {
        fn _assert_object_safe(_: &dyn Capability) {}
    }

    #[test]
    fn test_fn_capability_calls_closure() {
        let cap = FnCapability::new("len", |args: &[Value]| Ok(json!(args.len())))
            .with_description("counts arguments");
        assert_eq!(cap.name(), "len");
        assert_eq!(cap.description(), "counts arguments");
        assert_eq!(cap.call(&[json!(1), json!("a")]).unwrap(), json!(2));
    }

    #[test]
    fn test_fn_capability_error_is_returned_not_raised() {
        let cap = FnCapability::new("fail", |_: &[Value]| {
            Err(CapabilityError::Failed("boom".into()))
        });
        assert_eq!(
            cap.call(&[]).unwrap_err(),
            CapabilityError::Failed("boom".into())
        );
    }
}
