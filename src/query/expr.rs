//! The object-level expression tree queries are written in: member access over entity-typed
//! lambda parameters, method calls, operators and object construction.

use crate::value::{ClrType, Value};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    /// Bitwise `&`.
    And,
    /// Bitwise `|`.
    Or,
    AndAlso,
    OrElse,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    /// `left ?? right`
    Coalesce,
}

impl BinaryOp {
    fn token(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::AndAlso => "&&",
            BinaryOp::OrElse => "||",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::Coalesce => "??",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Negate,
}

/// Type a static member or method is declared on; translators dispatch on it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeclaringType {
    Object,
    String,
    Math,
    DateTime,
    Enum,
    Nullable,
    /// Sequence operators applied to collections and groupings (`Where`, `Count`, `Sum`, ...).
    Enumerable,
    /// `EF.Functions`-style database functions.
    DbFunctions,
    Custom(String),
}

impl fmt::Display for DeclaringType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclaringType::Object => f.write_str("object"),
            DeclaringType::String => f.write_str("string"),
            DeclaringType::Math => f.write_str("Math"),
            DeclaringType::DateTime => f.write_str("DateTime"),
            DeclaringType::Enum => f.write_str("Enum"),
            DeclaringType::Nullable => f.write_str("Nullable"),
            DeclaringType::Enumerable => f.write_str("Enumerable"),
            DeclaringType::DbFunctions => f.write_str("DbFunctions"),
            DeclaringType::Custom(name) => f.write_str(name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub declaring: DeclaringType,
    pub name: String,
}

impl MethodRef {
    pub fn new(declaring: DeclaringType, name: &str) -> Self {
        MethodRef {
            declaring,
            name: name.to_string(),
        }
    }

    pub fn is(&self, declaring: &DeclaringType, name: &str) -> bool {
        &self.declaring == declaring && self.name == name
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Expr,
}

impl Lambda {
    pub fn new(params: &[&str], body: Expr) -> Self {
        Lambda {
            params: params.iter().map(|p| p.to_string()).collect(),
            body,
        }
    }

    pub fn param(&self, i: usize) -> Option<&str> {
        self.params.get(i).map(String::as_str)
    }
}

impl fmt::Display for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.len() == 1 {
            write!(f, "{} => {}", self.params[0], self.body)
        } else {
            write!(f, "({}) => {}", self.params.join(", "), self.body)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    Constant {
        value: Value,
        ty: ClrType,
    },
    /// A value captured from the caller, supplied at execution time.
    Parameter {
        name: String,
        ty: ClrType,
    },
    /// A lambda parameter.
    Variable(String),
    Member {
        target: Box<Expr>,
        member: String,
    },
    StaticMember {
        declaring: DeclaringType,
        member: String,
    },
    Call {
        target: Option<Box<Expr>>,
        method: MethodRef,
        args: Vec<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Convert {
        operand: Box<Expr>,
        ty: ClrType,
    },
    Conditional {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
    /// Object (anonymous type) construction.
    New {
        members: Vec<(String, Expr)>,
    },
    NewArray {
        element: ClrType,
        elements: Vec<Expr>,
    },
    Lambda(Box<Lambda>),
}

/// A lambda parameter reference.
pub fn var(name: &str) -> Expr {
    Expr::Variable(name.to_string())
}

/// A captured parameter.
pub fn param(name: &str, ty: ClrType) -> Expr {
    Expr::Parameter {
        name: name.to_string(),
        ty,
    }
}

pub fn lambda(params: &[&str], body: Expr) -> Lambda {
    Lambda::new(params, body)
}

pub fn new_object(members: Vec<(&str, Expr)>) -> Expr {
    Expr::New {
        members: members.into_iter().map(|(n, e)| (n.to_string(), e)).collect(),
    }
}

pub fn static_call(declaring: DeclaringType, name: &str, args: Vec<Expr>) -> Expr {
    Expr::Call {
        target: None,
        method: MethodRef::new(declaring, name),
        args,
    }
}

pub fn static_member(declaring: DeclaringType, member: &str) -> Expr {
    Expr::StaticMember {
        declaring,
        member: member.to_string(),
    }
}

impl Expr {
    pub fn constant(value: Value, ty: ClrType) -> Expr {
        Expr::Constant { value, ty }
    }

    pub fn int(n: i32) -> Expr {
        Expr::constant(Value::Int(i64::from(n)), ClrType::Int32)
    }

    pub fn long(n: i64) -> Expr {
        Expr::constant(Value::Int(n), ClrType::Int64)
    }

    pub fn double(f: f64) -> Expr {
        Expr::constant(Value::Float(f), ClrType::Float64)
    }

    pub fn string(s: &str) -> Expr {
        Expr::constant(Value::from(s), ClrType::String)
    }

    pub fn bool(b: bool) -> Expr {
        Expr::constant(Value::Bool(b), ClrType::Bool)
    }

    /// The untyped `null` literal.
    pub fn null() -> Expr {
        Expr::constant(Value::Null, ClrType::Object)
    }

    pub fn member(self, name: &str) -> Expr {
        Expr::Member {
            target: Box::new(self),
            member: name.to_string(),
        }
    }

    pub fn call(self, declaring: DeclaringType, name: &str, args: Vec<Expr>) -> Expr {
        Expr::Call {
            target: Some(Box::new(self)),
            method: MethodRef::new(declaring, name),
            args,
        }
    }

    /// A sequence operator on a collection-valued expression (`b.Posts.Count()`).
    pub fn seq(self, name: &str, args: Vec<Expr>) -> Expr {
        self.call(DeclaringType::Enumerable, name, args)
    }

    fn binary(self, op: BinaryOp, other: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Equal, other)
    }

    pub fn ne(self, other: Expr) -> Expr {
        self.binary(BinaryOp::NotEqual, other)
    }

    pub fn lt(self, other: Expr) -> Expr {
        self.binary(BinaryOp::LessThan, other)
    }

    pub fn le(self, other: Expr) -> Expr {
        self.binary(BinaryOp::LessThanOrEqual, other)
    }

    pub fn gt(self, other: Expr) -> Expr {
        self.binary(BinaryOp::GreaterThan, other)
    }

    pub fn ge(self, other: Expr) -> Expr {
        self.binary(BinaryOp::GreaterThanOrEqual, other)
    }

    pub fn and(self, other: Expr) -> Expr {
        self.binary(BinaryOp::AndAlso, other)
    }

    pub fn or(self, other: Expr) -> Expr {
        self.binary(BinaryOp::OrElse, other)
    }

    pub fn bit_and(self, other: Expr) -> Expr {
        self.binary(BinaryOp::And, other)
    }

    pub fn bit_or(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Or, other)
    }

    pub fn add(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Subtract, other)
    }

    pub fn mul(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Multiply, other)
    }

    pub fn div(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Divide, other)
    }

    pub fn rem(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Modulo, other)
    }

    pub fn coalesce(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Coalesce, other)
    }

    pub fn not(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(self),
        }
    }

    pub fn negate(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Negate,
            operand: Box::new(self),
        }
    }

    pub fn convert(self, ty: ClrType) -> Expr {
        Expr::Convert {
            operand: Box::new(self),
            ty,
        }
    }

    pub fn conditional(test: Expr, if_true: Expr, if_false: Expr) -> Expr {
        Expr::Conditional {
            test: Box::new(test),
            if_true: Box::new(if_true),
            if_false: Box::new(if_false),
        }
    }

    /// Removes conversions to `object` (boxing) wrapped around an operand.
    pub fn strip_object_convert(&self) -> &Expr {
        match self {
            Expr::Convert { operand, ty } if matches!(ty, ClrType::Object) => operand.strip_object_convert(),
            other => other,
        }
    }

    /// Whether the expression mentions the lambda parameter `name`.
    pub fn references(&self, name: &str) -> bool {
        match self {
            Expr::Variable(v) => v == name,
            Expr::Constant { .. } | Expr::Parameter { .. } | Expr::StaticMember { .. } => false,
            Expr::Member { target, .. } => target.references(name),
            Expr::Call { target, args, .. } => {
                target.as_ref().is_some_and(|t| t.references(name)) || args.iter().any(|a| a.references(name))
            }
            Expr::Binary { left, right, .. } => left.references(name) || right.references(name),
            Expr::Unary { operand, .. } | Expr::Convert { operand, .. } => operand.references(name),
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => test.references(name) || if_true.references(name) || if_false.references(name),
            Expr::New { members } => members.iter().any(|(_, e)| e.references(name)),
            Expr::NewArray { elements, .. } => elements.iter().any(|e| e.references(name)),
            Expr::Lambda(l) => !l.params.iter().any(|p| p == name) && l.body.references(name),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant { value, .. } => match value {
                Value::Null => f.write_str("null"),
                Value::Text(s) => write!(f, "\"{}\"", s),
                other => write!(f, "{}", other),
            },
            Expr::Parameter { name, .. } => write!(f, "__{}", name),
            Expr::Variable(v) => f.write_str(v),
            Expr::Member { target, member } => write!(f, "{}.{}", target, member),
            Expr::StaticMember { declaring, member } => write!(f, "{}.{}", declaring, member),
            Expr::Call { target, method, args } => {
                match target {
                    Some(t) => write!(f, "{}.{}(", t, method.name)?,
                    None => write!(f, "{}.{}(", method.declaring, method.name)?,
                }
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                f.write_str(")")
            }
            Expr::Binary { op, left, right } => write!(f, "({} {} {})", left, op.token(), right),
            Expr::Unary { op, operand } => match op {
                UnaryOp::Not => write!(f, "!{}", operand),
                UnaryOp::Negate => write!(f, "-{}", operand),
            },
            Expr::Convert { operand, ty } => write!(f, "({}){}", ty, operand),
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => write!(f, "({} ? {} : {})", test, if_true, if_false),
            Expr::New { members } => {
                f.write_str("new { ")?;
                for (i, (name, e)) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} = {}", name, e)?;
                }
                f.write_str(" }")
            }
            Expr::NewArray { element, elements } => {
                write!(f, "new {}[] {{ ", element)?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                f.write_str(" }")
            }
            Expr::Lambda(l) => write!(f, "{}", l),
        }
    }
}
