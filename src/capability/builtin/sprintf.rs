//! Builtin capability: `sprintf(format, args...)`.
//!
//! Supported verbs are `%s`, `%v` and `%d`; `%%` is a literal percent.
//! Strings are inserted verbatim, every other value as compact JSON.

use serde_json::Value;

use crate::capability::Capability;
use crate::error::CapabilityError;

pub struct Sprintf;

impl Capability for Sprintf {
    fn name(&self) -> &str {
        "sprintf"
    }

    fn description(&self) -> &str {
        "format a string with %s, %v and %d verbs"
    }

    fn call(&self, args: &[Value]) -> Result<Value, CapabilityError> {
        let Some((format, rest)) = args.split_first() else {
            return Err(CapabilityError::InvalidArgument(
                "sprintf requires a format string".into(),
            ));
        };
        let format = format.as_str().ok_or_else(|| {
            CapabilityError::InvalidArgument("sprintf format must be a string".into())
        })?;
        render(format, rest).map(Value::String)
    }
}

fn render(format: &str, args: &[Value]) -> Result<String, CapabilityError> {
    let mut out = String::with_capacity(format.len());
    let mut remaining = args.iter();
    let mut used = 0usize;
    let mut chars = format.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(verb @ ('s' | 'v' | 'd')) => {
                let arg = remaining.next().ok_or_else(|| {
                    CapabilityError::InvalidArgument(format!(
                        "format needs more than {used} arguments"
                    ))
                })?;
                used += 1;
                if verb == 'd' && !arg.is_i64() && !arg.is_u64() {
                    return Err(CapabilityError::InvalidArgument(format!(
                        "%d expects an integer, got {arg}"
                    )));
                }
                push_value(&mut out, arg);
            }
            Some(other) => {
                return Err(CapabilityError::InvalidArgument(format!(
                    "unsupported verb %{other}"
                )))
            }
            None => {
                return Err(CapabilityError::InvalidArgument(
                    "format ends with a lone %".into(),
                ))
            }
        }
    }

    if used < args.len() {
        return Err(CapabilityError::InvalidArgument(format!(
            "format uses {used} of {} arguments",
            args.len()
        )));
    }
    Ok(out)
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(args: &[Value]) -> Result<Value, CapabilityError> {
        Sprintf.call(args)
    }

    #[test]
    fn test_greeting() {
        let out = call(&[json!("Hello, %s!"), json!("world")]).unwrap();
        assert_eq!(out, json!("Hello, world!"));
    }

    #[test]
    fn test_mixed_verbs() {
        let out = call(&[json!("%s has %d items: %v (100%%)"), json!("cart"), json!(3), json!([1, "a"])]).unwrap();
        assert_eq!(out, json!("cart has 3 items: [1,\"a\"] (100%)"));
    }

    #[test]
    fn test_format_only() {
        assert_eq!(call(&[json!("plain")]).unwrap(), json!("plain"));
    }

    #[test]
    fn test_missing_argument() {
        let err = call(&[json!("Hello, %s!")]).unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidArgument(_)));
    }

    #[test]
    fn test_extra_argument() {
        let err = call(&[json!("Hello"), json!("world")]).unwrap_err();
        assert!(err.to_string().contains("0 of 1"));
    }

    #[test]
    fn test_d_requires_integer() {
        let err = call(&[json!("%d"), json!("seven")]).unwrap_err();
        assert!(err.to_string().contains("%d expects an integer"));
    }

    #[test]
    fn test_no_arguments_at_all() {
        assert!(call(&[]).is_err());
        assert!(call(&[json!(1)]).is_err());
    }

    #[test]
    fn test_unsupported_verb_and_trailing_percent() {
        assert!(call(&[json!("%q"), json!(1)]).is_err());
        assert!(call(&[json!("50%")]).is_err());
    }
}
