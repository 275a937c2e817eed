//! Variant B: Jinja expressions through minijinja.
//!
//! Functions take a `Rest<Value>`, so each capability is bound exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use minijinja::machinery::{ast, parse_expr};
use minijinja::value::{Rest, Value as JinjaValue};
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior};
use serde_json::Value;

use super::{run_detached, Env, ExpressionEngine, MAX_CAPABILITY_ARGS};
use crate::capability::CapabilityRegistry;
use crate::error::EngineError;

pub struct JinjaEngine {
    env: Arc<Environment<'static>>,
    registry: Arc<CapabilityRegistry>,
}

impl JinjaEngine {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        // No builtin filters, tests or globals.
        let mut env = Environment::empty();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        for name in registry.names() {
            let registry = registry.clone();
            let capability = name.to_string();
            env.add_function(name.to_string(), move |args: Rest<JinjaValue>| {
                call_capability(&registry, &capability, &args)
            });
        }

        Self {
            env: Arc::new(env),
            registry,
        }
    }
}

#[async_trait]
impl ExpressionEngine for JinjaEngine {
    fn language(&self) -> &'static str {
        "jinja"
    }

    async fn execute(
        &self,
        timeout: Duration,
        expression: &str,
        env: &Env,
    ) -> Result<Value, EngineError> {
        let jinja = self.env.clone();
        let registry = self.registry.clone();
        let expression = expression.to_string();
        let env = env.clone();
        run_detached(timeout, move || evaluate(&jinja, &registry, expression, &env)).await
    }
}

fn evaluate(
    jinja: &Environment<'static>,
    registry: &CapabilityRegistry,
    expression: String,
    env: &Env,
) -> Result<Value, EngineError> {
    let parsed = parse_expr(&expression).map_err(|e| EngineError::Compile(e.to_string()))?;
    check_calls(&parsed, registry).map_err(EngineError::Compile)?;
    drop(parsed);

    let compiled = jinja
        .compile_expression_owned(expression)
        .map_err(|e| EngineError::Compile(e.to_string()))?;

    let declared: HashSet<&str> = env
        .keys()
        .map(String::as_str)
        .chain(registry.names())
        .collect();
    let mut undeclared: Vec<String> = compiled
        .undeclared_variables(false)
        .into_iter()
        .filter(|name| !declared.contains(name.as_str()))
        .collect();
    if !undeclared.is_empty() {
        undeclared.sort();
        return Err(EngineError::Compile(format!(
            "undefined variable: {}",
            undeclared.join(", ")
        )));
    }

    let output = compiled
        .eval(env)
        .map_err(|e| EngineError::Execution(e.to_string()))?;
    if output.is_undefined() {
        return Err(EngineError::Execution("expression evaluated to an undefined value".into()));
    }
    serde_json::to_value(&output)
        .map_err(|e| EngineError::Execution(format!("converting output: {e}")))
}

/// Bridges a minijinja call into the registry.
fn call_capability(
    registry: &CapabilityRegistry,
    name: &str,
    args: &[JinjaValue],
) -> Result<JinjaValue, Error> {
    let args = args
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::new(ErrorKind::InvalidOperation, format!("converting arguments: {e}"))
        })?;
    registry
        .invoke(name, &args)
        .map(JinjaValue::from_serialize)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

/// Walks the parsed expression and rejects anything but whitelisted calls.
///
/// Jinja would report an unknown or over-long call only when it is reached;
/// checking the tree first keeps those failures compile errors.
fn check_calls(expr: &ast::Expr<'_>, registry: &CapabilityRegistry) -> Result<(), String> {
    use ast::Expr;

    match expr {
        Expr::Var(_) | Expr::Const(_) => Ok(()),
        Expr::Call(call) => {
            let Expr::Var(callee) = &call.expr else {
                return Err("only whitelisted functions can be called".into());
            };
            if !registry.contains(callee.id) {
                return Err(format!("function '{}' is not whitelisted", callee.id));
            }
            if call.args.len() > MAX_CAPABILITY_ARGS {
                return Err(format!(
                    "'{}' called with {} arguments, at most {MAX_CAPABILITY_ARGS} are supported",
                    callee.id,
                    call.args.len()
                ));
            }
            for arg in &call.args {
                match arg {
                    ast::CallArg::Pos(arg) => check_calls(arg, registry)?,
                    _ => return Err("keyword and splat arguments are not supported".into()),
                }
            }
            Ok(())
        }
        Expr::Slice(slice) => {
            check_calls(&slice.expr, registry)?;
            [&slice.start, &slice.stop, &slice.step]
                .into_iter()
                .flatten()
                .try_for_each(|e| check_calls(e, registry))
        }
        Expr::UnaryOp(op) => check_calls(&op.expr, registry),
        Expr::BinOp(op) => {
            check_calls(&op.left, registry)?;
            check_calls(&op.right, registry)
        }
        Expr::Compare(cmp) => {
            check_calls(&cmp.expr, registry)?;
            cmp.ops.iter().try_for_each(|op| check_calls(&op.expr, registry))
        }
        Expr::IfExpr(cond) => {
            check_calls(&cond.test_expr, registry)?;
            check_calls(&cond.true_expr, registry)?;
            match &cond.false_expr {
                Some(e) => check_calls(e, registry),
                None => Ok(()),
            }
        }
        Expr::Filter(filter) => Err(format!("filter '{}' is not available", filter.name)),
        Expr::Test(test) => Err(format!("test '{}' is not available", test.name)),
        Expr::GetAttr(attr) => check_calls(&attr.expr, registry),
        Expr::GetItem(item) => {
            check_calls(&item.expr, registry)?;
            check_calls(&item.subscript_expr, registry)
        }
        Expr::List(list) => list.items.iter().try_for_each(|e| check_calls(e, registry)),
        Expr::Map(map) => map
            .keys
            .iter()
            .chain(map.values.iter())
            .try_for_each(|e| check_calls(e, registry)),
    }
}
