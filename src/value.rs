// File: src/value.rs
//
// The tagged value model shared by the compiler's constant pool and the
// VM's stack/globals/registers. One `enum Value` with a `ValueKind`
// discriminant for fast kind checks, a canonical byte encoding used for
// constant-pool string interning and for equality/ordering, and a
// `Display` impl for the textual representation `print` uses.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;

use crate::bytecode::Chunk;
use crate::dataframe::DataFrame;

/// The static "shape" of a value, independent of its contents. Used by the
/// compiler's expression-value stack (`ExpressionData`) and by the VM for
/// quick `match`es that don't need to destructure a full `Value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Nil,
    Bool,
    Integer,
    Float,
    Byte,
    String,
    Array,
    List,
    Enum,
    Closure,
    Function,
    Native,
    Class,
    Instance,
    DataFrame,
    Range,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Nil => "nil",
            ValueKind::Bool => "bool",
            ValueKind::Integer => "int",
            ValueKind::Float => "float",
            ValueKind::Byte => "byte",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::List => "list",
            ValueKind::Enum => "enum",
            ValueKind::Closure => "closure",
            ValueKind::Function => "func",
            ValueKind::Native => "native",
            ValueKind::Class => "class",
            ValueKind::Instance => "instance",
            ValueKind::DataFrame => "table",
            ValueKind::Range => "range",
        };
        write!(f, "{name}")
    }
}

/// A compiled function's prototype: its code chunk plus the metadata the
/// VM needs to set up a call frame and, if closed over, a closure.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionProto {
    pub name: String,
    pub arity: u8,
    pub chunk: Chunk,
    pub upvalue_count: u16,
}

/// Where an upvalue gets its value from: either still live on some frame's
/// stack slot (`Open`), or lifted into its own storage once that frame
/// popped while still captured (`Closed`).
#[derive(Debug, Clone)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct Closure {
    pub function: Rc<FunctionProto>,
    pub upvalues: Vec<Rc<RefCell<UpvalueState>>>,
}

#[derive(Debug, Clone)]
pub struct ClassTemplate {
    pub name: String,
    /// Member name -> either a method closure or a `Value::Nil` placeholder
    /// for an uninitialized field, mirroring `OP_BIND_PROPERTY`'s effect on
    /// the class template built at runtime.
    pub members: AHashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub class: Rc<RefCell<ClassTemplate>>,
    pub fields: AHashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct EnumDef {
    pub name: String,
    pub variants: Vec<String>,
}

/// The native-function protocol's return-type/arity metadata, kept
/// alongside the function pointer as a `Value` so a native can be stored in
/// the constant pool / passed around like any other callable.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    pub func: crate::native::NativeFn,
    pub has_return: bool,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction").field("name", &self.name).finish()
    }
}

impl PartialEq for NativeFunction {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Byte(u8),
    Str(Rc<str>),
    /// Dense, row-major, possibly multi-dimensional array. `dims.len()` is
    /// the dimension count; `elements.len() == dims.iter().product()`.
    Array { element_kind: ValueKind, dims: Vec<usize>, elements: Rc<RefCell<Vec<Value>>> },
    /// Hash-like list: homogeneous key/value kinds, heterogeneous contents
    /// allowed only insofar as the compiler's static typing allows it.
    List { key_kind: ValueKind, value_kind: ValueKind, map: Rc<RefCell<Vec<(Value, Value)>>> },
    Enum(Rc<EnumDef>, u8),
    Closure(Rc<RefCell<Closure>>),
    Function(Rc<FunctionProto>),
    Native(Rc<NativeFunction>),
    /// Interior-mutable because a class body is assembled one
    /// `OP_BIND_PROPERTY` at a time while the surrounding `OP_CLASS` value
    /// is already sitting on the stack.
    Class(Rc<RefCell<ClassTemplate>>),
    Instance(Rc<RefCell<Instance>>),
    DataFrame(Rc<RefCell<DataFrame>>),
    Range { start: i64, end: i64, current: i64 },
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Bool(_) => ValueKind::Bool,
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::Byte(_) => ValueKind::Byte,
            Value::Str(_) => ValueKind::String,
            Value::Array { .. } => ValueKind::Array,
            Value::List { .. } => ValueKind::List,
            Value::Enum(..) => ValueKind::Enum,
            Value::Closure(_) => ValueKind::Closure,
            Value::Function(_) => ValueKind::Function,
            Value::Native(_) => ValueKind::Native,
            Value::Class(_) => ValueKind::Class,
            Value::Instance(_) => ValueKind::Instance,
            Value::DataFrame(_) => ValueKind::DataFrame,
            Value::Range { .. } => ValueKind::Range,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Integer(i) => *i != 0,
            _ => true,
        }
    }

    pub fn string(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    /// Canonical byte encoding used for constant-pool string interning and
    /// for total-order comparisons across like kinds. Restricted to the
    /// kinds the specification allows to be compared/ordered: integer,
    /// float, string, bool, byte. Callers must not invoke this on other
    /// kinds (the compiler rejects ordering comparisons on them before any
    /// bytecode referencing this function is ever emitted).
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        match self {
            Value::Nil => vec![0],
            Value::Bool(b) => vec![if *b { 1 } else { 0 }],
            Value::Integer(i) => i.to_be_bytes().to_vec(),
            Value::Float(f) => f.to_be_bytes().to_vec(),
            Value::Byte(b) => vec![*b],
            Value::Str(s) => s.as_bytes().to_vec(),
            _ => Vec::new(),
        }
    }

    /// Equality via canonical byte encoding for scalar kinds; structural
    /// equality for everything else. Matches the spec's "equality via byte
    /// equality" rule while still letting arrays/lists compare sensibly for
    /// `==` (only ordering is restricted to scalars).
    pub fn values_equal(a: &Value, b: &Value) -> bool {
        if a.kind() != b.kind() {
            return false;
        }
        match (a, b) {
            (Value::Array { elements: ea, .. }, Value::Array { elements: eb, .. }) => {
                let ea = ea.borrow();
                let eb = eb.borrow();
                ea.len() == eb.len() && ea.iter().zip(eb.iter()).all(|(x, y)| Value::values_equal(x, y))
            }
            _ => a.to_canonical_bytes() == b.to_canonical_bytes() && scalar_like(a) == scalar_like(b),
        }
    }

    /// Total order across the scalar kinds the spec allows to be ordered.
    /// `NaN` on either side of a float comparison is a runtime error rather
    /// than a silent `false`, since a silently-wrong ordering would violate
    /// "runtime failures are fatal".
    pub fn compare(a: &Value, b: &Value) -> Result<Ordering, String> {
        match (a, b) {
            (Value::Integer(x), Value::Integer(y)) => Ok(x.cmp(y)),
            (Value::Byte(x), Value::Byte(y)) => Ok(x.cmp(y)),
            (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
            (Value::Str(x), Value::Str(y)) => Ok(x.as_bytes().cmp(y.as_bytes())),
            (Value::Float(x), Value::Float(y)) => x
                .partial_cmp(y)
                .ok_or_else(|| "cannot order NaN".to_string()),
            (Value::Integer(x), Value::Float(y)) => (*x as f64)
                .partial_cmp(y)
                .ok_or_else(|| "cannot order NaN".to_string()),
            (Value::Float(x), Value::Integer(y)) => x
                .partial_cmp(&(*y as f64))
                .ok_or_else(|| "cannot order NaN".to_string()),
            _ => Err(format!("cannot order values of kind {} and {}", a.kind(), b.kind())),
        }
    }
}

/// A small helper so `values_equal`'s fallback doesn't spuriously consider
/// e.g. `Nil` and an empty string equal (both encode to `vec![0]` only in
/// the `Nil`/`Bool(false)` collision case, which this distinguishes).
fn scalar_like(v: &Value) -> u8 {
    match v {
        Value::Nil => 0,
        Value::Bool(_) => 1,
        Value::Integer(_) => 2,
        Value::Float(_) => 3,
        Value::Byte(_) => 4,
        Value::Str(_) => 5,
        _ => 255,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(fl) => write!(f, "{fl}"),
            Value::Byte(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Array { elements, .. } => {
                write!(f, "[")?;
                for (i, e) in elements.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, "]")
            }
            Value::List { map, .. } => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Enum(def, tag) => {
                let name = def.variants.get(*tag as usize).map(String::as_str).unwrap_or("?");
                write!(f, "{}::{}", def.name, name)
            }
            Value::Closure(c) => write!(f, "<closure {}>", c.borrow().function.name),
            Value::Function(fun) => write!(f, "<func {}>", fun.name),
            Value::Native(n) => write!(f, "<native {}>", n.name),
            Value::Class(c) => write!(f, "<class {}>", c.borrow().name),
            Value::Instance(i) => write!(f, "<instance {}>", i.borrow().class.borrow().name),
            Value::DataFrame(df) => write!(f, "<table {}>", df.borrow().name),
            Value::Range { start, end, .. } => write!(f, "{start}..{end}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_strings_have_equal_canonical_bytes() {
        let a = Value::string("abc");
        let b = Value::string("abc");
        assert_eq!(a.to_canonical_bytes(), b.to_canonical_bytes());
        assert!(Value::values_equal(&a, &b));
    }

    #[test]
    fn nil_and_false_are_not_equal_despite_zero_encoding() {
        assert!(!Value::values_equal(&Value::Nil, &Value::Bool(false)));
    }

    #[test]
    fn ordering_forbidden_across_kinds() {
        assert!(Value::compare(&Value::Integer(1), &Value::string("x")).is_err());
    }

    #[test]
    fn nan_ordering_is_an_error_not_false() {
        assert!(Value::compare(&Value::Float(f64::NAN), &Value::Float(1.0)).is_err());
    }

    #[test]
    fn truthiness_matches_spec_scalars() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Integer(0).is_truthy());
        assert!(Value::Integer(1).is_truthy());
        assert!(Value::string("").is_truthy());
    }
}
