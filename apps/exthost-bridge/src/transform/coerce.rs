use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::{is_uri_shaped, Uri};

/// Declared type of one handler parameter. The peer's runtime only knows
/// doubles, so integral parameters arrive as `3.0` and are narrowed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Long,
    Short,
    Byte,
    Float,
    Double,
    Bool,
    String,
    Uri,
    Any,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::Int => "int",
            ParamType::Long => "long",
            ParamType::Short => "short",
            ParamType::Byte => "byte",
            ParamType::Float => "float",
            ParamType::Double => "double",
            ParamType::Bool => "bool",
            ParamType::String => "string",
            ParamType::Uri => "uri",
            ParamType::Any => "any",
        }
    }

    fn integral_range(self) -> Option<(i64, i64)> {
        match self {
            ParamType::Int => Some((i32::MIN as i64, i32::MAX as i64)),
            ParamType::Long => Some((i64::MIN, i64::MAX)),
            ParamType::Short => Some((i16::MIN as i64, i16::MAX as i64)),
            ParamType::Byte => Some((i8::MIN as i64, i8::MAX as i64)),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoercionError {
    #[error("argument {index}: expected {expected}, got {found}")]
    TypeMismatch {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },
    #[error("argument {index}: {value} is not an integral number")]
    NotIntegral { index: usize, value: f64 },
    #[error("argument {index}: {value} is out of range for {expected}")]
    OutOfRange {
        index: usize,
        value: f64,
        expected: &'static str,
    },
    #[error("argument {index}: {message}")]
    Decode { index: usize, message: String },
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Normalizes `args` against the declared parameter list.
///
/// Missing trailing arguments become `""` for `String` and `null` otherwise;
/// explicit `null` is accepted for every type; surplus arguments are passed
/// through untouched.
pub fn coerce_args(mut args: Vec<Value>, params: &[ParamType]) -> Result<Vec<Value>, CoercionError> {
    for (index, param) in params.iter().enumerate() {
        if index >= args.len() {
            args.push(match param {
                ParamType::String => Value::String(String::new()),
                _ => Value::Null,
            });
            continue;
        }
        let value = std::mem::take(&mut args[index]);
        args[index] = coerce_one(index, *param, value)?;
    }
    Ok(args)
}

fn coerce_one(index: usize, param: ParamType, value: Value) -> Result<Value, CoercionError> {
    if value.is_null() {
        return Ok(value);
    }
    let mismatch = |value: &Value| CoercionError::TypeMismatch {
        index,
        expected: param.as_str(),
        found: kind_of(value),
    };
    match param {
        ParamType::Any => Ok(value),
        ParamType::Int | ParamType::Long | ParamType::Short | ParamType::Byte => {
            let (min, max) = param.integral_range().unwrap_or((i64::MIN, i64::MAX));
            let integral = match &value {
                Value::Number(number) => match number.as_i64() {
                    Some(int) => int,
                    None => {
                        let float = number.as_f64().ok_or_else(|| mismatch(&value))?;
                        if !float.is_finite() || float.fract() != 0.0 {
                            return Err(CoercionError::NotIntegral { index, value: float });
                        }
                        if float < min as f64 || float >= max as f64 + 1.0 {
                            return Err(CoercionError::OutOfRange {
                                index,
                                value: float,
                                expected: param.as_str(),
                            });
                        }
                        float as i64
                    }
                },
                _ => return Err(mismatch(&value)),
            };
            if integral < min || integral > max {
                return Err(CoercionError::OutOfRange {
                    index,
                    value: integral as f64,
                    expected: param.as_str(),
                });
            }
            Ok(Value::from(integral))
        }
        ParamType::Float | ParamType::Double => match &value {
            Value::Number(_) => Ok(value),
            _ => Err(mismatch(&value)),
        },
        ParamType::Bool => match &value {
            Value::Bool(_) => Ok(value),
            Value::Number(number) => Ok(Value::Bool(number.as_f64().unwrap_or(0.0) != 0.0)),
            _ => Err(mismatch(&value)),
        },
        ParamType::String => match &value {
            Value::String(_) => Ok(value),
            _ => Err(mismatch(&value)),
        },
        ParamType::Uri => match &value {
            Value::Object(map) if is_uri_shaped(map) => Ok(value),
            Value::String(text) => Uri::parse(text)
                .map(|uri| uri.to_value())
                .map_err(|err| CoercionError::Decode {
                    index,
                    message: format!("invalid uri {text:?}: {err}"),
                }),
            _ => Err(mismatch(&value)),
        },
    }
}

/// Read-only view over coerced arguments for handler bodies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: Vec<Value>,
}

static NULL: Value = Value::Null;

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.values
    }

    /// The raw argument, `null` when absent.
    pub fn value(&self, index: usize) -> &Value {
        self.values.get(index).unwrap_or(&NULL)
    }

    pub fn i64(&self, index: usize) -> Result<i64, CoercionError> {
        let value = coerce_one(index, ParamType::Long, self.value(index).clone())?;
        value.as_i64().ok_or_else(|| self.mismatch(index, ParamType::Long))
    }

    pub fn i32(&self, index: usize) -> Result<i32, CoercionError> {
        let value = coerce_one(index, ParamType::Int, self.value(index).clone())?;
        value
            .as_i64()
            .and_then(|int| i32::try_from(int).ok())
            .ok_or_else(|| self.mismatch(index, ParamType::Int))
    }

    pub fn f64(&self, index: usize) -> Result<f64, CoercionError> {
        self.value(index)
            .as_f64()
            .ok_or_else(|| self.mismatch(index, ParamType::Double))
    }

    pub fn bool(&self, index: usize) -> Result<bool, CoercionError> {
        let value = coerce_one(index, ParamType::Bool, self.value(index).clone())?;
        value
            .as_bool()
            .ok_or_else(|| self.mismatch(index, ParamType::Bool))
    }

    pub fn string(&self, index: usize) -> Result<&str, CoercionError> {
        self.value(index)
            .as_str()
            .ok_or_else(|| self.mismatch(index, ParamType::String))
    }

    pub fn uri(&self, index: usize) -> Result<Uri, CoercionError> {
        let value = coerce_one(index, ParamType::Uri, self.value(index).clone())?;
        if value.is_null() {
            return Err(self.mismatch(index, ParamType::Uri));
        }
        serde_json::from_value(value).map_err(|err| CoercionError::Decode {
            index,
            message: err.to_string(),
        })
    }

    pub fn decode<T: DeserializeOwned>(&self, index: usize) -> Result<T, CoercionError> {
        T::deserialize(self.value(index)).map_err(|err| CoercionError::Decode {
            index,
            message: err.to_string(),
        })
    }

    fn mismatch(&self, index: usize, expected: ParamType) -> CoercionError {
        CoercionError::TypeMismatch {
            index,
            expected: expected.as_str(),
            found: kind_of(self.value(index)),
        }
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integral_floats_are_narrowed() {
        let out = coerce_args(vec![json!(3.0), json!(-7.0), json!(12)], &[
            ParamType::Int,
            ParamType::Long,
            ParamType::Byte,
        ])
        .unwrap();
        assert_eq!(out, vec![json!(3), json!(-7), json!(12)]);
        assert!(out[0].is_i64());
    }

    #[test]
    fn fractional_and_out_of_range_are_rejected() {
        assert_eq!(
            coerce_args(vec![json!(3.5)], &[ParamType::Int]),
            Err(CoercionError::NotIntegral { index: 0, value: 3.5 })
        );
        assert!(matches!(
            coerce_args(vec![json!(300.0)], &[ParamType::Byte]),
            Err(CoercionError::OutOfRange { index: 0, .. })
        ));
        assert!(matches!(
            coerce_args(vec![json!(40000)], &[ParamType::Short]),
            Err(CoercionError::OutOfRange { .. })
        ));
        assert!(matches!(
            coerce_args(vec![json!("3")], &[ParamType::Int]),
            Err(CoercionError::TypeMismatch { found: "string", .. })
        ));
    }

    #[test]
    fn long_bounds_do_not_saturate() {
        assert!(matches!(
            coerce_args(vec![json!(9.223372036854775808e18)], &[ParamType::Long]),
            Err(CoercionError::OutOfRange { index: 0, .. })
        ));
        assert_eq!(
            coerce_args(vec![json!(-9.223372036854775808e18)], &[ParamType::Long]),
            Ok(vec![json!(i64::MIN)])
        );
        assert_eq!(
            coerce_args(vec![json!(2147483647.0)], &[ParamType::Int]),
            Ok(vec![json!(2147483647)])
        );
        assert!(matches!(
            coerce_args(vec![json!(2147483648.0)], &[ParamType::Int]),
            Err(CoercionError::OutOfRange { .. })
        ));
    }

    #[test]
    fn numbers_become_bools() {
        let out = coerce_args(vec![json!(0.0), json!(2.0), json!(true)], &[
            ParamType::Bool,
            ParamType::Bool,
            ParamType::Bool,
        ])
        .unwrap();
        assert_eq!(out, vec![json!(false), json!(true), json!(true)]);
    }

    #[test]
    fn missing_trailing_arguments_are_filled() {
        let out = coerce_args(vec![json!(1.0)], &[
            ParamType::Int,
            ParamType::String,
            ParamType::Uri,
        ])
        .unwrap();
        assert_eq!(out, vec![json!(1), json!(""), Value::Null]);
    }

    #[test]
    fn surplus_arguments_pass_through() {
        let out = coerce_args(vec![json!("a"), json!(1.5), json!({"k": 1})], &[ParamType::String])
            .unwrap();
        assert_eq!(out, vec![json!("a"), json!(1.5), json!({"k": 1})]);
    }

    #[test]
    fn uri_strings_become_components() {
        let out = coerce_args(vec![json!("file:///tmp/a.txt")], &[ParamType::Uri]).unwrap();
        assert_eq!(out[0]["$mid"], json!(1));
        assert_eq!(out[0]["path"], json!("/tmp/a.txt"));
    }

    #[test]
    fn args_accessors() {
        let args = Args::new(vec![
            json!(2.0),
            json!("hello"),
            json!(1),
            Uri::file("/x").to_value(),
            json!([1, 2]),
        ]);
        assert_eq!(args.i32(0).unwrap(), 2);
        assert_eq!(args.i64(0).unwrap(), 2);
        assert_eq!(args.f64(0).unwrap(), 2.0);
        assert_eq!(args.string(1).unwrap(), "hello");
        assert!(args.bool(2).unwrap());
        assert_eq!(args.uri(3).unwrap(), Uri::file("/x"));
        assert_eq!(args.decode::<Vec<u8>>(4).unwrap(), vec![1, 2]);
        assert_eq!(args.value(10), &Value::Null);
        assert!(matches!(
            args.string(0),
            Err(CoercionError::TypeMismatch { index: 0, .. })
        ));
    }
}
