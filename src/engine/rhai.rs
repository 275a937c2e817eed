//! Variant A: Rhai expressions.
//!
//! Rhai resolves native functions by exact arity, so each capability is
//! registered once per arity `0..=MAX_CAPABILITY_ARGS`, every parameter typed
//! as `Dynamic` and every overload dispatching to the same registry entry.

use std::any::TypeId;
use std::sync::Arc;
use std::time::Duration;

use ::rhai::serde::{from_dynamic, to_dynamic};
use ::rhai::{
    ASTNode, Dynamic, Engine, EvalAltResult, Expr, FnCallExpr, NativeCallContext,
    OptimizationLevel, Position, Scope, AST,
};
use async_trait::async_trait;
use serde_json::Value;

use super::{run_detached, Env, ExpressionEngine, MAX_CAPABILITY_ARGS};
use crate::capability::CapabilityRegistry;
use crate::error::EngineError;

pub struct RhaiEngine {
    engine: Arc<Engine>,
    registry: Arc<CapabilityRegistry>,
}

impl RhaiEngine {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        // `new_raw` has no packages and no module resolver: the only
        // functions an expression can reach are the ones registered below.
        let mut engine = Engine::new_raw();
        engine
            .set_strict_variables(true)
            .set_fail_on_invalid_map_property(true)
            .set_optimization_level(OptimizationLevel::None)
            .set_allow_looping(false);
        engine.disable_symbol("eval");

        for name in registry.names() {
            for arity in 0..=MAX_CAPABILITY_ARGS {
                let registry = registry.clone();
                let capability = name.to_string();
                engine.register_raw_fn::<Dynamic>(
                    name,
                    vec![TypeId::of::<Dynamic>(); arity],
                    move |_ctx: NativeCallContext, args: &mut [&mut Dynamic]| {
                        call_capability(&registry, &capability, args)
                    },
                );
            }
        }

        Self {
            engine: Arc::new(engine),
            registry,
        }
    }
}

#[async_trait]
impl ExpressionEngine for RhaiEngine {
    fn language(&self) -> &'static str {
        "rhai"
    }

    async fn execute(
        &self,
        timeout: Duration,
        expression: &str,
        env: &Env,
    ) -> Result<Value, EngineError> {
        let engine = self.engine.clone();
        let registry = self.registry.clone();
        let expression = expression.to_string();
        let env = env.clone();
        run_detached(timeout, move || evaluate(&engine, &registry, &expression, &env)).await
    }
}

fn evaluate(
    engine: &Engine,
    registry: &CapabilityRegistry,
    expression: &str,
    env: &Env,
) -> Result<Value, EngineError> {
    let mut scope = Scope::new();
    for (name, value) in env {
        let value = to_dynamic(value)
            .map_err(|e| EngineError::Compile(format!("binding '{name}': {e}")))?;
        scope.push_dynamic(name.as_str(), value);
    }

    let ast = engine
        .compile_expression_with_scope(&scope, expression)
        .map_err(|e| EngineError::Compile(e.to_string()))?;
    check_calls(&ast, registry)?;

    let output = engine
        .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
        .map_err(|e| EngineError::Execution(e.to_string()))?;
    from_dynamic::<Value>(&output)
        .map_err(|e| EngineError::Execution(format!("converting output: {e}")))
}

/// Bridges a Rhai call into the registry.
///
/// Capability errors become Rhai runtime errors so they propagate through
/// the interpreter like any other evaluation failure.
fn call_capability(
    registry: &CapabilityRegistry,
    name: &str,
    args: &mut [&mut Dynamic],
) -> Result<Dynamic, Box<EvalAltResult>> {
    let args = args
        .iter()
        .map(|arg| from_dynamic::<Value>(&**arg))
        .collect::<Result<Vec<_>, _>>()?;
    match registry.invoke(name, &args) {
        Ok(value) => to_dynamic(&value),
        Err(e) => Err(EvalAltResult::ErrorRuntime(e.to_string().into(), Position::NONE).into()),
    }
}

/// Rejects calls the whitelist cannot serve before anything runs.
fn check_calls(ast: &AST, registry: &CapabilityRegistry) -> Result<(), EngineError> {
    let mut violation = None;
    ast.walk(&mut |path: &[ASTNode]| {
        let checked = match path.last() {
            Some(ASTNode::Expr(Expr::FnCall(call, _))) => check_call(call, registry),
            Some(ASTNode::Expr(Expr::MethodCall(call, _))) => {
                Err(format!("method call '{}' is not allowed", call.name))
            }
            _ => Ok(()),
        };
        match checked {
            Ok(()) => true,
            Err(e) => {
                violation = Some(e);
                false
            }
        }
    });
    match violation {
        Some(e) => Err(EngineError::Compile(e)),
        None => Ok(()),
    }
}

fn check_call(call: &FnCallExpr, registry: &CapabilityRegistry) -> Result<(), String> {
    let name = call.name.as_str();
    // Operators are parsed as calls too; their names are never identifiers.
    if call.is_operator_call() || !name.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
    {
        return Ok(());
    }
    if !call.namespace.is_empty() {
        return Err(format!("namespaced call '{name}' is not allowed"));
    }
    if !registry.contains(name) {
        return Err(format!("function '{name}' is not whitelisted"));
    }
    if call.args.len() > MAX_CAPABILITY_ARGS {
        return Err(format!(
            "'{name}' called with {} arguments, at most {MAX_CAPABILITY_ARGS} are supported",
            call.args.len()
        ));
    }
    Ok(())
}
