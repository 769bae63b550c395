//! Client-side evaluation of query-tree expressions over materialized results. Used for
//! predicates and final projections that have no SQL translation.

use super::expr::{BinaryOp, DeclaringType, Expr, Lambda, MethodRef, UnaryOp};
use super::parameters::QueryParameters;
use crate::error::{QueryError, Result};
use crate::shaper::ShapedValue;
use crate::value::{ClrType, Value};
use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, Timelike};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type ClientFunction = Arc<dyn Fn(&[ShapedValue]) -> Result<ShapedValue> + Send + Sync>;

/// Client implementations of custom methods (`Custom` or `DbFunctions` declaring types), keyed by
/// `Declaring.Method`. Instance methods receive the target as their first argument.
#[derive(Clone, Default)]
pub struct ClientFunctions {
    functions: HashMap<String, ClientFunction>,
}

impl ClientFunctions {
    pub fn register(&mut self, declaring: &DeclaringType, name: &str, function: ClientFunction) {
        self.functions.insert(format!("{}.{}", declaring, name), function);
    }

    fn get(&self, method: &MethodRef) -> Option<&ClientFunction> {
        self.functions.get(&format!("{}.{}", method.declaring, method.name))
    }
}

impl fmt::Debug for ClientFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

fn scalar(v: Value) -> ShapedValue {
    if v.is_null() {
        ShapedValue::Null
    } else {
        ShapedValue::Scalar(v)
    }
}

fn null_reference(expr: &Expr) -> QueryError {
    QueryError::InvalidOperation(format!("null reference while evaluating '{}'", expr))
}

fn unsupported(expr: &Expr, details: &str) -> QueryError {
    QueryError::translation_with(expr, format!("cannot be evaluated on the client: {}", details))
}

/// Evaluates expressions with lambda parameters bound to shaped values.
#[derive(Clone)]
pub struct Evaluator<'a> {
    parameters: &'a QueryParameters,
    functions: &'a ClientFunctions,
    scope: Vec<(String, ShapedValue)>,
}

impl<'a> Evaluator<'a> {
    pub fn new(parameters: &'a QueryParameters, functions: &'a ClientFunctions) -> Self {
        Evaluator {
            parameters,
            functions,
            scope: Vec::new(),
        }
    }

    pub fn bind(mut self, name: &str, value: ShapedValue) -> Self {
        self.scope.push((name.to_string(), value));
        self
    }

    /// Applies `lambda` to `args` (bound positionally to its parameters).
    pub fn apply(&self, lambda: &Lambda, args: Vec<ShapedValue>) -> Result<ShapedValue> {
        let mut inner = self.clone();
        for (name, value) in lambda.params.iter().zip(args) {
            inner.scope.push((name.clone(), value));
        }
        inner.eval(&lambda.body)
    }

    pub fn test(&self, lambda: &Lambda, arg: ShapedValue) -> Result<bool> {
        let v = self.apply(lambda, vec![arg])?;
        Ok(matches!(v, ShapedValue::Scalar(Value::Bool(true))))
    }

    pub fn eval(&self, expr: &Expr) -> Result<ShapedValue> {
        match expr {
            Expr::Constant { value, .. } => Ok(scalar(value.clone())),
            Expr::Parameter { name, .. } => self
                .parameters
                .get(name)
                .cloned()
                .map(scalar)
                .ok_or_else(|| QueryError::InvalidOperation(format!("no value was supplied for parameter '{}'", name))),
            Expr::Variable(name) => self
                .scope
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| QueryError::InvalidOperation(format!("unbound variable '{}'", name))),
            Expr::Member { target, member } => {
                let t = self.eval(target)?;
                self.member(expr, t, member)
            }
            Expr::StaticMember { declaring, member } => match (declaring, member.as_str()) {
                (DeclaringType::DateTime, "Now") => Ok(scalar(Value::DateTime(chrono::Local::now().naive_local()))),
                (DeclaringType::DateTime, "UtcNow") => Ok(scalar(Value::DateTime(chrono::Utc::now().naive_utc()))),
                (DeclaringType::DateTime, "Today") => Ok(scalar(Value::DateTime(
                    chrono::Local::now().date_naive().and_time(chrono::NaiveTime::MIN),
                ))),
                (DeclaringType::String, "Empty") => Ok(scalar(Value::Text(String::new()))),
                _ => Err(unsupported(expr, "unknown static member")),
            },
            Expr::Call { target, method, args } => self.call(expr, target.as_deref(), method, args),
            Expr::Binary { op, left, right } => self.binary(expr, *op, left, right),
            Expr::Unary { op, operand } => {
                let v = self.eval(operand)?;
                match (op, v) {
                    (_, ShapedValue::Null) => Ok(ShapedValue::Null),
                    (UnaryOp::Not, ShapedValue::Scalar(Value::Bool(b))) => Ok(scalar(Value::Bool(!b))),
                    (UnaryOp::Not, ShapedValue::Scalar(Value::Int(n))) => Ok(scalar(Value::Int(!n))),
                    (UnaryOp::Negate, ShapedValue::Scalar(Value::Int(n))) => Ok(scalar(Value::Int(n.wrapping_neg()))),
                    (UnaryOp::Negate, ShapedValue::Scalar(Value::Float(f))) => Ok(scalar(Value::Float(-f))),
                    _ => Err(unsupported(expr, "operand type")),
                }
            }
            Expr::Convert { operand, ty } => {
                let v = self.eval(operand)?;
                convert(expr, v, ty)
            }
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => match self.eval(test)? {
                ShapedValue::Scalar(Value::Bool(true)) => self.eval(if_true),
                _ => self.eval(if_false),
            },
            Expr::New { members } => Ok(ShapedValue::Object(
                members
                    .iter()
                    .map(|(name, e)| Ok((name.clone(), self.eval(e)?)))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Expr::NewArray { elements, .. } => Ok(ShapedValue::Collection(
                elements.iter().map(|e| self.eval(e)).collect::<Result<Vec<_>>>()?,
            )),
            Expr::Lambda(_) => Err(unsupported(expr, "a lambda is not a value")),
        }
    }

    fn member(&self, expr: &Expr, target: ShapedValue, member: &str) -> Result<ShapedValue> {
        if member == "HasValue" {
            return Ok(scalar(Value::Bool(!target.is_null())));
        }
        if target.is_null() {
            return Err(if member == "Value" {
                QueryError::InvalidOperation(format!("nullable object must have a value: '{}'", expr))
            } else {
                null_reference(expr)
            });
        }
        if member == "Value" {
            return Ok(target);
        }
        if let Some(v) = target.field(member) {
            return Ok(match v {
                ShapedValue::Scalar(v) => scalar(v),
                other => other,
            });
        }
        match (&target, member) {
            (ShapedValue::Scalar(Value::Text(s)), "Length") => Ok(scalar(Value::Int(s.chars().count() as i64))),
            (ShapedValue::Scalar(Value::DateTime(d)), part) => datetime_part(expr, d, part),
            (ShapedValue::Scalar(Value::Date(d)), part) => {
                datetime_part(expr, &d.and_time(chrono::NaiveTime::MIN), part)
            }
            (ShapedValue::Collection(items), "Count") => Ok(scalar(Value::Int(items.len() as i64))),
            (ShapedValue::Entity(_), _) => Ok(ShapedValue::Null),
            _ => Err(unsupported(expr, "unknown member")),
        }
    }

    fn call(&self, expr: &Expr, target: Option<&Expr>, method: &MethodRef, args: &[Expr]) -> Result<ShapedValue> {
        if let Some(f) = self.functions.get(method) {
            let mut values = Vec::with_capacity(args.len() + 1);
            if let Some(t) = target {
                values.push(self.eval(t)?);
            }
            for a in args {
                values.push(self.eval(a)?);
            }
            return f(&values);
        }
        if method.declaring == DeclaringType::Enumerable {
            let source = match target {
                Some(t) => self.eval(t)?,
                None => match args.first() {
                    Some(a) => self.eval(a)?,
                    None => return Err(unsupported(expr, "missing source")),
                },
            };
            let rest = if target.is_some() { args } else { &args[1..] };
            return self.sequence(expr, source, &method.name, rest);
        }
        let this = target.map(|t| self.eval(t)).transpose()?;
        let values = args.iter().map(|a| self.eval(a)).collect::<Result<Vec<_>>>()?;
        match (&method.declaring, method.name.as_str()) {
            (_, "Equals") => {
                let (a, b) = match (&this, values.as_slice()) {
                    (Some(t), [b]) => (t, b),
                    (None, [a, b]) => (a, b),
                    _ => return Err(unsupported(expr, "Equals arity")),
                };
                Ok(scalar(Value::Bool(a == b)))
            }
            (_, "ToString") => match this {
                Some(ShapedValue::Null) | None => Err(null_reference(expr)),
                Some(ShapedValue::Scalar(Value::Text(s))) => Ok(scalar(Value::Text(s))),
                Some(ShapedValue::Scalar(v)) => Ok(scalar(Value::Text(v.to_string()))),
                Some(_) => Err(unsupported(expr, "ToString on a structured value")),
            },
            (DeclaringType::String, _) => string_method(expr, &method.name, this, values),
            (DeclaringType::Math, _) => math_method(expr, &method.name, values),
            (DeclaringType::DateTime, _) => datetime_method(expr, &method.name, this, values),
            (DeclaringType::Enum, "HasFlag") => match (this, values.as_slice()) {
                (Some(ShapedValue::Scalar(Value::Int(x))), [ShapedValue::Scalar(Value::Int(y))]) => {
                    Ok(scalar(Value::Bool(x & y == *y)))
                }
                (Some(ShapedValue::Null), _) => Err(null_reference(expr)),
                _ => Err(unsupported(expr, "HasFlag operands")),
            },
            _ => Err(unsupported(expr, "no client implementation is registered")),
        }
    }

    fn sequence(&self, expr: &Expr, source: ShapedValue, name: &str, args: &[Expr]) -> Result<ShapedValue> {
        let items: Vec<ShapedValue> = match source {
            ShapedValue::Null => return Err(null_reference(expr)),
            other => match other.as_collection() {
                Some(items) => items.to_vec(),
                None => return Err(unsupported(expr, "source is not a sequence")),
            },
        };
        let lambda = match args.first() {
            Some(Expr::Lambda(l)) => Some(l.as_ref()),
            _ => None,
        };
        let project = |items: &[ShapedValue]| -> Result<Vec<ShapedValue>> {
            match lambda {
                Some(l) => items.iter().map(|i| self.apply(l, vec![i.clone()])).collect(),
                None => Ok(items.to_vec()),
            }
        };
        match name {
            "Where" => {
                let l = lambda.ok_or_else(|| unsupported(expr, "Where needs a predicate"))?;
                let mut kept = Vec::new();
                for i in items {
                    if self.test(l, i.clone())? {
                        kept.push(i);
                    }
                }
                Ok(ShapedValue::Collection(kept))
            }
            "Select" => Ok(ShapedValue::Collection(project(&items)?)),
            "Count" | "LongCount" => {
                let n = match lambda {
                    Some(l) => {
                        let mut n = 0;
                        for i in items {
                            if self.test(l, i)? {
                                n += 1;
                            }
                        }
                        n
                    }
                    None => items.len() as i64,
                };
                Ok(scalar(Value::Int(n)))
            }
            "Any" => match lambda {
                Some(l) => {
                    for i in items {
                        if self.test(l, i)? {
                            return Ok(scalar(Value::Bool(true)));
                        }
                    }
                    Ok(scalar(Value::Bool(false)))
                }
                None => Ok(scalar(Value::Bool(!items.is_empty()))),
            },
            "All" => {
                let l = lambda.ok_or_else(|| unsupported(expr, "All needs a predicate"))?;
                for i in items {
                    if !self.test(l, i)? {
                        return Ok(scalar(Value::Bool(false)));
                    }
                }
                Ok(scalar(Value::Bool(true)))
            }
            "Contains" => {
                let needle = match args.first() {
                    Some(a) => self.eval(a)?,
                    None => return Err(unsupported(expr, "Contains needs a value")),
                };
                Ok(scalar(Value::Bool(items.contains(&needle))))
            }
            "Sum" | "Min" | "Max" | "Average" => {
                let values: Vec<Value> = project(&items)?
                    .into_iter()
                    .filter_map(|v| v.as_scalar().cloned())
                    .collect();
                aggregate(expr, name, values)
            }
            _ => Err(unsupported(expr, "unknown sequence operator")),
        }
    }

    fn binary(&self, expr: &Expr, op: BinaryOp, left: &Expr, right: &Expr) -> Result<ShapedValue> {
        match op {
            BinaryOp::AndAlso => {
                if !truthy(&self.eval(left)?) {
                    return Ok(scalar(Value::Bool(false)));
                }
                return Ok(scalar(Value::Bool(truthy(&self.eval(right)?))));
            }
            BinaryOp::OrElse => {
                if truthy(&self.eval(left)?) {
                    return Ok(scalar(Value::Bool(true)));
                }
                return Ok(scalar(Value::Bool(truthy(&self.eval(right)?))));
            }
            BinaryOp::Coalesce => {
                let l = self.eval(left)?;
                return if l.is_null() { self.eval(right) } else { Ok(l) };
            }
            _ => {}
        }
        let l = self.eval(left)?;
        let r = self.eval(right)?;
        match op {
            BinaryOp::Equal => return Ok(scalar(Value::Bool(l == r))),
            BinaryOp::NotEqual => return Ok(scalar(Value::Bool(l != r))),
            _ => {}
        }
        let (lv, rv) = match (&l, &r) {
            (ShapedValue::Scalar(a), ShapedValue::Scalar(b)) => (a, b),
            (ShapedValue::Null, _) | (_, ShapedValue::Null) => {
                return Ok(match op {
                    BinaryOp::Add if is_text(&l) || is_text(&r) => scalar(Value::Text(format!(
                        "{}{}",
                        text_of(&l),
                        text_of(&r)
                    ))),
                    BinaryOp::LessThan
                    | BinaryOp::LessThanOrEqual
                    | BinaryOp::GreaterThan
                    | BinaryOp::GreaterThanOrEqual => scalar(Value::Bool(false)),
                    _ => ShapedValue::Null,
                })
            }
            _ => return Err(unsupported(expr, "operands are not scalars")),
        };
        let ordering = || compare(lv, rv).ok_or_else(|| unsupported(expr, "values are not comparable"));
        let v = match op {
            BinaryOp::LessThan => Value::Bool(ordering()? == Ordering::Less),
            BinaryOp::LessThanOrEqual => Value::Bool(ordering()? != Ordering::Greater),
            BinaryOp::GreaterThan => Value::Bool(ordering()? == Ordering::Greater),
            BinaryOp::GreaterThanOrEqual => Value::Bool(ordering()? != Ordering::Less),
            BinaryOp::Add if matches!(lv, Value::Text(_)) || matches!(rv, Value::Text(_)) => {
                Value::Text(format!("{}{}", text_of(&l), text_of(&r)))
            }
            BinaryOp::And | BinaryOp::Or => match (lv, rv) {
                (Value::Bool(a), Value::Bool(b)) => Value::Bool(if op == BinaryOp::And { *a & *b } else { *a | *b }),
                (Value::Int(a), Value::Int(b)) => Value::Int(if op == BinaryOp::And { a & b } else { a | b }),
                _ => return Err(unsupported(expr, "bitwise operands")),
            },
            _ => arithmetic(expr, op, lv, rv)?,
        };
        Ok(scalar(v))
    }
}

fn truthy(v: &ShapedValue) -> bool {
    matches!(v, ShapedValue::Scalar(Value::Bool(true)))
}

fn is_text(v: &ShapedValue) -> bool {
    matches!(v, ShapedValue::Scalar(Value::Text(_)))
}

fn text_of(v: &ShapedValue) -> String {
    match v {
        ShapedValue::Scalar(Value::Text(s)) => s.clone(),
        ShapedValue::Scalar(other) => other.to_string(),
        _ => String::new(),
    }
}

/// Total order over comparable scalar values; integers and reals compare numerically.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::Uuid(x), Value::Uuid(y)) => Some(x.cmp(y)),
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn arithmetic(expr: &Expr, op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            Ok(Value::Int(match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Subtract => a.wrapping_sub(b),
                BinaryOp::Multiply => a.wrapping_mul(b),
                BinaryOp::Divide | BinaryOp::Modulo if b == 0 => {
                    return Err(QueryError::InvalidOperation(format!(
                        "attempted to divide by zero evaluating '{}'",
                        expr
                    )))
                }
                BinaryOp::Divide => a.wrapping_div(b),
                BinaryOp::Modulo => a.wrapping_rem(b),
                _ => return Err(unsupported(expr, "operator")),
            }))
        }
        (Value::DateTime(d), Value::DateTime(e)) if op == BinaryOp::Subtract => {
            Ok(Value::Float((*d - *e).num_milliseconds() as f64 / 86_400_000.0))
        }
        _ => {
            let (a, b) = match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(unsupported(expr, "arithmetic operands")),
            };
            Ok(Value::Float(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Subtract => a - b,
                BinaryOp::Multiply => a * b,
                BinaryOp::Divide => a / b,
                BinaryOp::Modulo => a % b,
                _ => return Err(unsupported(expr, "operator")),
            }))
        }
    }
}

fn aggregate(expr: &Expr, name: &str, values: Vec<Value>) -> Result<ShapedValue> {
    match name {
        "Sum" => {
            if values.iter().all(|v| matches!(v, Value::Int(_))) {
                Ok(scalar(Value::Int(values.iter().filter_map(Value::as_i64).sum())))
            } else {
                Ok(scalar(Value::Float(values.iter().filter_map(Value::as_f64).sum())))
            }
        }
        "Average" => {
            if values.is_empty() {
                return Err(QueryError::InvalidOperation("sequence contains no elements".into()));
            }
            let n = values.len() as f64;
            Ok(scalar(Value::Float(values.iter().filter_map(Value::as_f64).sum::<f64>() / n)))
        }
        _ => {
            let want = if name == "Min" { Ordering::Less } else { Ordering::Greater };
            let mut best: Option<Value> = None;
            for v in values {
                best = match best {
                    None => Some(v),
                    Some(b) => match compare(&v, &b) {
                        Some(o) if o == want => Some(v),
                        Some(_) => Some(b),
                        None => return Err(unsupported(expr, "values are not comparable")),
                    },
                };
            }
            best.map(scalar)
                .ok_or_else(|| QueryError::InvalidOperation("sequence contains no elements".into()))
        }
    }
}

fn convert(expr: &Expr, v: ShapedValue, ty: &ClrType) -> Result<ShapedValue> {
    let value = match v {
        ShapedValue::Null => {
            return if ty.can_be_null() {
                Ok(ShapedValue::Null)
            } else {
                Err(QueryError::InvalidOperation(format!(
                    "nullable object must have a value: '{}'",
                    expr
                )))
            }
        }
        ShapedValue::Scalar(v) => v,
        other => return Ok(other),
    };
    let out = match (ty.unwrap_nullable(), value) {
        (ClrType::Object, v) => v,
        (ClrType::Int16 | ClrType::Int32 | ClrType::Int64 | ClrType::Enum(_), Value::Float(f)) => Value::Int(f.trunc() as i64),
        (ClrType::Int16 | ClrType::Int32 | ClrType::Int64 | ClrType::Enum(_), Value::Bool(b)) => Value::Int(i64::from(b)),
        (ClrType::Float64 | ClrType::Decimal, Value::Int(n)) => Value::Float(n as f64),
        (ClrType::String, Value::Text(s)) => Value::Text(s),
        (ClrType::String, other) => Value::Text(other.to_string()),
        (target, v) => v.clone().coerce_to(target).unwrap_or(v),
    };
    Ok(scalar(out))
}

fn datetime_part(expr: &Expr, d: &NaiveDateTime, part: &str) -> Result<ShapedValue> {
    let v = match part {
        "Year" => Value::Int(i64::from(d.year())),
        "Month" => Value::Int(i64::from(d.month())),
        "Day" => Value::Int(i64::from(d.day())),
        "Hour" => Value::Int(i64::from(d.hour())),
        "Minute" => Value::Int(i64::from(d.minute())),
        "Second" => Value::Int(i64::from(d.second())),
        "Millisecond" => Value::Int(i64::from(d.nanosecond() / 1_000_000)),
        "DayOfYear" => Value::Int(i64::from(d.ordinal())),
        "DayOfWeek" => Value::Int(i64::from(d.weekday().num_days_from_sunday())),
        "Date" => Value::DateTime(d.date().and_time(chrono::NaiveTime::MIN)),
        "Ticks" => {
            let epoch = NaiveDate::from_ymd_opt(1, 1, 1)
                .map(|e| e.and_time(chrono::NaiveTime::MIN))
                .ok_or_else(|| unsupported(expr, "tick epoch"))?;
            let micros = (*d - epoch)
                .num_microseconds()
                .ok_or_else(|| unsupported(expr, "tick overflow"))?;
            Value::Int(micros * 10)
        }
        _ => return Err(unsupported(expr, "unknown DateTime member")),
    };
    Ok(scalar(v))
}

fn datetime_method(expr: &Expr, name: &str, this: Option<ShapedValue>, args: Vec<ShapedValue>) -> Result<ShapedValue> {
    let d = match this {
        Some(ShapedValue::Scalar(Value::DateTime(d))) => d,
        Some(ShapedValue::Null) => return Err(null_reference(expr)),
        _ => return Err(unsupported(expr, "DateTime target")),
    };
    let amount = match args.first() {
        Some(ShapedValue::Scalar(v)) => v.as_f64().ok_or_else(|| unsupported(expr, "DateTime argument"))?,
        _ => return Err(unsupported(expr, "DateTime argument")),
    };
    let shifted = match name {
        "AddDays" => d.checked_add_signed(Duration::milliseconds((amount * 86_400_000.0).round() as i64)),
        "AddHours" => d.checked_add_signed(Duration::milliseconds((amount * 3_600_000.0).round() as i64)),
        "AddMinutes" => d.checked_add_signed(Duration::milliseconds((amount * 60_000.0).round() as i64)),
        "AddSeconds" => d.checked_add_signed(Duration::milliseconds((amount * 1_000.0).round() as i64)),
        "AddMilliseconds" => d.checked_add_signed(Duration::milliseconds(amount.round() as i64)),
        "AddMonths" | "AddYears" => {
            let months = if name == "AddYears" { amount as i64 * 12 } else { amount as i64 };
            let m = Months::new(months.unsigned_abs() as u32);
            if months >= 0 {
                d.checked_add_months(m)
            } else {
                d.checked_sub_months(m)
            }
        }
        _ => return Err(unsupported(expr, "unknown DateTime method")),
    };
    shifted
        .map(|d| scalar(Value::DateTime(d)))
        .ok_or_else(|| QueryError::InvalidOperation(format!("DateTime out of range evaluating '{}'", expr)))
}

fn string_method(expr: &Expr, name: &str, this: Option<ShapedValue>, args: Vec<ShapedValue>) -> Result<ShapedValue> {
    let text = |v: &ShapedValue| match v {
        ShapedValue::Scalar(Value::Text(s)) => Some(s.clone()),
        _ => None,
    };
    if this.is_none() {
        return match name {
            "IsNullOrEmpty" => Ok(scalar(Value::Bool(
                args.first().map_or(true, |a| text(a).map_or(true, |s| s.is_empty())),
            ))),
            "IsNullOrWhiteSpace" => Ok(scalar(Value::Bool(
                args.first()
                    .map_or(true, |a| text(a).map_or(true, |s| s.trim().is_empty())),
            ))),
            "Concat" => Ok(scalar(Value::Text(args.iter().map(text_of).collect()))),
            _ => Err(unsupported(expr, "unknown string method")),
        };
    }
    let s = match this.as_ref().and_then(text) {
        Some(s) => s,
        None => return Err(null_reference(expr)),
    };
    let arg_text = |i: usize| args.get(i).and_then(text);
    let arg_int = |i: usize| args.get(i).and_then(|a| a.as_scalar()).and_then(Value::as_i64);
    let v = match name {
        "Contains" => Value::Bool(s.contains(arg_text(0).unwrap_or_default().as_str())),
        "StartsWith" => Value::Bool(s.starts_with(arg_text(0).unwrap_or_default().as_str())),
        "EndsWith" => Value::Bool(s.ends_with(arg_text(0).unwrap_or_default().as_str())),
        "ToUpper" => Value::Text(s.to_uppercase()),
        "ToLower" => Value::Text(s.to_lowercase()),
        "Trim" => Value::Text(s.trim().to_string()),
        "TrimStart" => Value::Text(s.trim_start().to_string()),
        "TrimEnd" => Value::Text(s.trim_end().to_string()),
        "Replace" => Value::Text(s.replace(
            arg_text(0).unwrap_or_default().as_str(),
            arg_text(1).unwrap_or_default().as_str(),
        )),
        "IndexOf" => {
            let needle = arg_text(0).unwrap_or_default();
            Value::Int(
                s.find(&needle)
                    .map(|byte| s[..byte].chars().count() as i64)
                    .unwrap_or(-1),
            )
        }
        "Substring" => {
            let chars: Vec<char> = s.chars().collect();
            let start = arg_int(0).unwrap_or(0).max(0) as usize;
            let len = arg_int(1).map(|l| l.max(0) as usize).unwrap_or(chars.len().saturating_sub(start));
            if start + len > chars.len() {
                return Err(QueryError::InvalidOperation(format!(
                    "index and length must refer to a location within the string: '{}'",
                    expr
                )));
            }
            Value::Text(chars[start..start + len].iter().collect())
        }
        _ => return Err(unsupported(expr, "unknown string method")),
    };
    Ok(scalar(v))
}

fn math_method(expr: &Expr, name: &str, args: Vec<ShapedValue>) -> Result<ShapedValue> {
    let values: Vec<Value> = args.iter().filter_map(|a| a.as_scalar().cloned()).collect();
    if values.len() != args.len() {
        return Ok(ShapedValue::Null);
    }
    let all_int = values.iter().all(|v| matches!(v, Value::Int(_)));
    let f = |i: usize| values.get(i).and_then(Value::as_f64).ok_or_else(|| unsupported(expr, "Math argument"));
    let v = match name {
        "Abs" if all_int => Value::Int(values.first().and_then(Value::as_i64).unwrap_or(0).wrapping_abs()),
        "Abs" => Value::Float(f(0)?.abs()),
        "Ceiling" => Value::Float(f(0)?.ceil()),
        "Floor" => Value::Float(f(0)?.floor()),
        "Round" => {
            let digits = values.get(1).and_then(Value::as_i64).unwrap_or(0);
            let scale = 10f64.powi(digits as i32);
            Value::Float(round_half_even(f(0)? * scale) / scale)
        }
        "Pow" => Value::Float(f(0)?.powf(f(1)?)),
        "Sqrt" => Value::Float(f(0)?.sqrt()),
        "Sign" => Value::Int(match f(0)? {
            x if x > 0.0 => 1,
            x if x < 0.0 => -1,
            _ => 0,
        }),
        "Max" | "Min" => {
            let (a, b) = match values.as_slice() {
                [a, b] => (a, b),
                _ => return Err(unsupported(expr, "Math arity")),
            };
            let o = compare(a, b).ok_or_else(|| unsupported(expr, "values are not comparable"))?;
            let pick_a = if name == "Max" { o != Ordering::Less } else { o != Ordering::Greater };
            if pick_a {
                a.clone()
            } else {
                b.clone()
            }
        }
        _ => return Err(unsupported(expr, "unknown Math method")),
    };
    Ok(scalar(v))
}

/// Banker's rounding, the default midpoint rule of `Math.Round`.
fn round_half_even(x: f64) -> f64 {
    let r = x.round();
    if (x - x.trunc()).abs() == 0.5 && r % 2.0 != 0.0 {
        r - x.signum()
    } else {
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expr::{lambda, new_object, static_call, var};

    fn eval(e: &Expr) -> ShapedValue {
        let params = QueryParameters::new().with("min", 3);
        let functions = ClientFunctions::default();
        Evaluator::new(&params, &functions).eval(e).unwrap()
    }

    #[test]
    fn null_semantics_follow_the_object_model() {
        assert_eq!(eval(&Expr::null().eq(Expr::null())), scalar(Value::Bool(true)));
        assert_eq!(eval(&Expr::null().lt(Expr::int(1))), scalar(Value::Bool(false)));
        assert_eq!(eval(&Expr::null().add(Expr::int(1))), ShapedValue::Null);
        assert_eq!(eval(&Expr::null().coalesce(Expr::string("x"))), scalar(Value::from("x")));
    }

    #[test]
    fn evaluates_string_and_math_methods() {
        let e = Expr::string("  Hello ").call(DeclaringType::String, "Trim", vec![]);
        assert_eq!(eval(&e), scalar(Value::from("Hello")));
        let round = static_call(DeclaringType::Math, "Round", vec![Expr::double(2.5)]);
        assert_eq!(eval(&round), scalar(Value::Float(2.0)));
        let sub = Expr::string("abcdef").call(DeclaringType::String, "Substring", vec![Expr::int(1), Expr::int(3)]);
        assert_eq!(eval(&sub), scalar(Value::from("bcd")));
    }

    #[test]
    fn binds_lambda_parameters_and_captured_values() {
        let params = QueryParameters::new().with("min", 3);
        let functions = ClientFunctions::default();
        let ev = Evaluator::new(&params, &functions);
        let row = ShapedValue::Object(vec![("Rating".into(), scalar(Value::Int(5)))]);
        let pred = lambda(&["b"], var("b").member("Rating").ge(crate::query::expr::param("min", ClrType::Int32)));
        assert!(ev.test(&pred, row.clone()).unwrap());
        let projected = ev
            .apply(&lambda(&["b"], new_object(vec![("R", var("b").member("Rating"))])), vec![row])
            .unwrap();
        assert_eq!(projected, ShapedValue::Object(vec![("R".into(), scalar(Value::Int(5)))]));
    }

    #[test]
    fn custom_functions_are_looked_up_by_declaring_type() {
        let params = QueryParameters::new();
        let mut functions = ClientFunctions::default();
        let custom = DeclaringType::Custom("Strings".into());
        functions.register(
            &custom,
            "Reverse",
            Arc::new(|args: &[ShapedValue]| -> Result<ShapedValue> {
                Ok(scalar(Value::Text(text_of(&args[0]).chars().rev().collect())))
            }),
        );
        let e = static_call(custom, "Reverse", vec![Expr::string("abc")]);
        assert_eq!(Evaluator::new(&params, &functions).eval(&e).unwrap(), scalar(Value::from("cba")));
    }

    #[test]
    fn missing_parameter_is_an_invalid_operation() {
        let params = QueryParameters::new();
        let functions = ClientFunctions::default();
        let err = Evaluator::new(&params, &functions)
            .eval(&crate::query::expr::param("x", ClrType::Int32))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_operation");
    }
}
