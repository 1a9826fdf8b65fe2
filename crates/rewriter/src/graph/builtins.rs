// Shape semantics for call_function and call_method targets
//
// Only the handful of callables that show up around conv/bn blocks in traced
// vision models are known. Anything else is an unresolved target.

use super::module::flatten_shape;
use super::value::{TensorMeta, Value};
use crate::{Result, RewriteError};
use std::collections::BTreeMap;

/// Evaluate a call_function node
pub fn call_function(target: &str, args: &[Value], kwargs: &BTreeMap<String, Value>) -> Result<Value> {
    match target {
        "add" | "sub" | "mul" => {
            expect_arity(target, args, 2)?;
            elementwise(target, &args[0], &args[1])
        }
        "relu" => {
            expect_arity(target, args, 1)?;
            Ok(Value::Tensor(args[0].as_tensor(target)?.clone()))
        }
        "flatten" => {
            let input = first_tensor(target, args)?;
            let start_dim = int_option(target, args.get(1), kwargs.get("start_dim"), 0)?;
            Ok(Value::Tensor(flatten_shape(target, input, start_dim)?))
        }
        "cat" => {
            let tensors = match args.first() {
                Some(Value::List(items)) if !items.is_empty() => items,
                _ => {
                    return Err(RewriteError::InvalidArgument(
                        "'cat' expects a non-empty list of tensors".to_string(),
                    ))
                }
            };
            let dim = int_option(target, args.get(1), kwargs.get("dim"), 0)?;
            concat(target, tensors, dim)
        }
        other => Err(RewriteError::UnresolvedTarget(format!("function '{}'", other))),
    }
}

/// Evaluate a call_method node; `args[0]` is the receiver
pub fn call_method(target: &str, args: &[Value], kwargs: &BTreeMap<String, Value>) -> Result<Value> {
    let receiver = first_tensor(target, args)?;
    match target {
        "relu" | "contiguous" => Ok(Value::Tensor(receiver.clone())),
        "flatten" => {
            let start_dim = int_option(target, args.get(1), kwargs.get("start_dim"), 0)?;
            Ok(Value::Tensor(flatten_shape(target, receiver, start_dim)?))
        }
        "size" => Ok(Value::List(receiver.shape.iter().map(|&d| Value::Int(d as i64)).collect())),
        "view" | "reshape" => {
            let dims = args[1..]
                .iter()
                .map(|v| v.as_int(target))
                .collect::<Result<Vec<i64>>>()?;
            Ok(Value::Tensor(reshape(target, receiver, &dims)?))
        }
        other => Err(RewriteError::UnresolvedTarget(format!("method '{}'", other))),
    }
}

fn expect_arity(target: &str, args: &[Value], expected: usize) -> Result<()> {
    if args.len() != expected {
        return Err(RewriteError::ArityMismatch {
            target: target.to_string(),
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

fn first_tensor<'a>(target: &str, args: &'a [Value]) -> Result<&'a TensorMeta> {
    args.first()
        .ok_or_else(|| RewriteError::ArityMismatch {
            target: target.to_string(),
            expected: 1,
            actual: 0,
        })?
        .as_tensor(target)
}

fn int_option(target: &str, positional: Option<&Value>, keyword: Option<&Value>, default: usize) -> Result<usize> {
    match positional.or(keyword) {
        None => Ok(default),
        Some(v) => {
            let n = v.as_int(target)?;
            usize::try_from(n)
                .map_err(|_| RewriteError::InvalidArgument(format!("'{}' got negative dimension {}", target, n)))
        }
    }
}

fn elementwise(target: &str, lhs: &Value, rhs: &Value) -> Result<Value> {
    match (lhs, rhs) {
        (Value::Tensor(a), Value::Tensor(b)) => {
            if a != b {
                return Err(RewriteError::ShapeMismatch {
                    target: target.to_string(),
                    detail: format!("{} vs {}", a, b),
                });
            }
            Ok(Value::Tensor(a.clone()))
        }
        (Value::Tensor(t), Value::Int(_) | Value::Float(_)) | (Value::Int(_) | Value::Float(_), Value::Tensor(t)) => {
            Ok(Value::Tensor(t.clone()))
        }
        (a, b) => Err(RewriteError::InvalidArgument(format!(
            "'{}' cannot combine {} and {}",
            target,
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn concat(target: &str, items: &[Value], dim: usize) -> Result<Value> {
    let first = items[0].as_tensor(target)?;
    if dim >= first.rank() {
        return Err(RewriteError::ShapeMismatch {
            target: target.to_string(),
            detail: format!("dim {} out of range for {}", dim, first),
        });
    }
    let mut shape = first.shape.clone();
    for item in &items[1..] {
        let t = item.as_tensor(target)?;
        let compatible = t.rank() == first.rank()
            && t.shape.iter().zip(&first.shape).enumerate().all(|(i, (a, b))| i == dim || a == b);
        if !compatible {
            return Err(RewriteError::ShapeMismatch {
                target: target.to_string(),
                detail: format!("{} vs {} along dim {}", first, t, dim),
            });
        }
        shape[dim] += t.shape[dim];
    }
    Ok(Value::Tensor(TensorMeta::new(shape)))
}

fn reshape(target: &str, input: &TensorMeta, dims: &[i64]) -> Result<TensorMeta> {
    let inferred = dims.iter().filter(|&&d| d == -1).count();
    if inferred > 1 || dims.iter().any(|&d| d < -1) {
        return Err(RewriteError::InvalidArgument(format!("'{}' got invalid shape {:?}", target, dims)));
    }
    let known: usize = dims.iter().filter(|&&d| d != -1).map(|&d| d as usize).product();
    let total = input.numel();

    let shape: Vec<usize> = if inferred == 1 {
        if known == 0 || total % known != 0 {
            return Err(RewriteError::ShapeMismatch {
                target: target.to_string(),
                detail: format!("cannot view {} as {:?}", input, dims),
            });
        }
        dims.iter()
            .map(|&d| if d == -1 { total / known } else { d as usize })
            .collect()
    } else {
        dims.iter().map(|&d| d as usize).collect()
    };

    if shape.iter().product::<usize>() != total {
        return Err(RewriteError::ShapeMismatch {
            target: target.to_string(),
            detail: format!("cannot view {} as {:?}", input, dims),
        });
    }
    Ok(TensorMeta::new(shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_kwargs() -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    #[test]
    fn test_add_requires_matching_shapes() {
        let a = Value::tensor(vec![1, 4]);
        let b = Value::tensor(vec![1, 4]);
        assert_eq!(call_function("add", &[a.clone(), b], &no_kwargs()).unwrap(), a);

        let c = Value::tensor(vec![1, 5]);
        assert!(matches!(
            call_function("add", &[a, c], &no_kwargs()),
            Err(RewriteError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_flatten_and_cat() {
        let x = Value::tensor(vec![2, 3, 4, 4]);
        assert_eq!(
            call_function("flatten", &[x.clone(), Value::Int(1)], &no_kwargs()).unwrap(),
            Value::tensor(vec![2, 48])
        );

        let mut kwargs = no_kwargs();
        kwargs.insert("dim".to_string(), Value::Int(1));
        let cat = call_function("cat", &[Value::List(vec![x.clone(), x])], &kwargs).unwrap();
        assert_eq!(cat, Value::tensor(vec![2, 6, 4, 4]));
    }

    #[test]
    fn test_view_with_inferred_dim() {
        let x = Value::tensor(vec![2, 3, 4]);
        let out = call_method("view", &[x.clone(), Value::Int(2), Value::Int(-1)], &no_kwargs()).unwrap();
        assert_eq!(out, Value::tensor(vec![2, 12]));
        assert!(call_method("view", &[x, Value::Int(5), Value::Int(-1)], &no_kwargs()).is_err());
    }

    #[test]
    fn test_size_method() {
        let out = call_method("size", &[Value::tensor(vec![1, 2])], &no_kwargs()).unwrap();
        assert_eq!(out, Value::List(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn test_unknown_targets() {
        assert!(matches!(
            call_function("softmax", &[], &no_kwargs()),
            Err(RewriteError::UnresolvedTarget(_))
        ));
        assert!(matches!(
            call_method("transpose", &[Value::tensor(vec![1])], &no_kwargs()),
            Err(RewriteError::UnresolvedTarget(_))
        ));
    }
}
