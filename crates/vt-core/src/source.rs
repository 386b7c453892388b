//! Provenance of runtime values.

use crate::value::{DictObj, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKey {
    Int(i64),
    Bool(bool),
    Str(String),
    None,
    F64Bits(u64),
    Tuple(Vec<IndexKey>),
    /// Key stored in an auxiliary slot and reached through another source.
    Source(Rc<Source>),
}

impl IndexKey {
    /// Key form of a literal dict key or sequence index.
    #[must_use]
    pub fn from_literal(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(Self::Int(*v)),
            Value::Bool(v) => Some(Self::Bool(*v)),
            Value::Str(v) => Some(Self::Str(v.to_string())),
            Value::None => Some(Self::None),
            Value::Float(v) => Some(Self::F64Bits(v.to_bits())),
            Value::Tuple(items) => items
                .iter()
                .map(Self::from_literal)
                .collect::<Option<Vec<_>>>()
                .map(Self::Tuple),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_literal(&self) -> Option<Value> {
        match self {
            Self::Int(v) => Some(Value::Int(*v)),
            Self::Bool(v) => Some(Value::Bool(*v)),
            Self::Str(v) => Some(Value::str(v)),
            Self::None => Some(Value::None),
            Self::F64Bits(bits) => Some(Value::Float(f64::from_bits(*bits))),
            Self::Tuple(items) => items
                .iter()
                .map(Self::to_literal)
                .collect::<Option<Vec<_>>>()
                .map(Value::tuple),
            Self::Source(_) => None,
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Str(v) => write!(f, "'{v}'"),
            Self::None => f.write_str("None"),
            Self::F64Bits(bits) => write!(f, "{:?}", f64::from_bits(*bits)),
            Self::Tuple(items) => {
                f.write_str("(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Self::Source(source) => write!(f, "{}", source.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    Local,
    Global,
    Constant,
    LocalComposite,
    GlobalComposite,
    Random,
}

impl Provenance {
    #[must_use]
    pub fn is_constant(self) -> bool {
        self == Self::Constant
    }

    /// Reached through a structured composite (a registered module).
    #[must_use]
    pub fn is_composite(self) -> bool {
        matches!(self, Self::LocalComposite | Self::GlobalComposite)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Source {
    Local { name: String },
    Global { name: String },
    Attribute { base: Rc<Source>, member: String },
    Index { base: Rc<Source>, key: IndexKey },
    Constant { name: String },
    /// Absolute position inside a tuple iterator.
    IteratorPosition { base: Rc<Source>, index: usize },
    WeakGlobalRef { name: String },
    Random { index: usize },
    Composite { base: Rc<Source> },
}

impl Source {
    #[must_use]
    pub fn local(name: &str) -> Rc<Self> {
        Rc::new(Self::Local {
            name: name.to_owned(),
        })
    }

    #[must_use]
    pub fn global(name: &str) -> Rc<Self> {
        Rc::new(Self::Global {
            name: name.to_owned(),
        })
    }

    #[must_use]
    pub fn constant(name: &str) -> Rc<Self> {
        Rc::new(Self::Constant {
            name: name.to_owned(),
        })
    }

    #[must_use]
    pub fn weak_global(name: &str) -> Rc<Self> {
        Rc::new(Self::WeakGlobalRef {
            name: name.to_owned(),
        })
    }

    #[must_use]
    pub fn random(index: usize) -> Rc<Self> {
        Rc::new(Self::Random { index })
    }

    #[must_use]
    pub fn attr(base: &Rc<Self>, member: &str) -> Rc<Self> {
        Rc::new(Self::Attribute {
            base: Rc::clone(base),
            member: member.to_owned(),
        })
    }

    #[must_use]
    pub fn index(base: &Rc<Self>, key: IndexKey) -> Rc<Self> {
        Rc::new(Self::Index {
            base: Rc::clone(base),
            key,
        })
    }

    #[must_use]
    pub fn item(base: &Rc<Self>, position: usize) -> Rc<Self> {
        let key = IndexKey::Int(i64::try_from(position).unwrap_or(i64::MAX));
        Self::index(base, key)
    }

    #[must_use]
    pub fn iterator_position(base: &Rc<Self>, index: usize) -> Rc<Self> {
        Rc::new(Self::IteratorPosition {
            base: Rc::clone(base),
            index,
        })
    }

    #[must_use]
    pub fn composite(base: &Rc<Self>) -> Rc<Self> {
        Rc::new(Self::Composite {
            base: Rc::clone(base),
        })
    }

    /// Stable textual name, also used as the idempotence key.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Local { name } => format!("L['{name}']"),
            Self::Global { name } => format!("G['{name}']"),
            Self::Attribute { base, member } => format!("{}.{member}", base.name()),
            Self::Index { base, key } => format!("{}[{key}]", base.name()),
            Self::Constant { name } => name.clone(),
            Self::IteratorPosition { base, index } => {
                format!("___tuple_iterator_getitem({}, {index})", base.name())
            }
            Self::WeakGlobalRef { name } => format!("G['{name}']()"),
            Self::Random { index } => format!("random_value_{index}"),
            Self::Composite { base } => base.name(),
        }
    }

    #[must_use]
    pub fn provenance(&self) -> Provenance {
        match self {
            Self::Local { .. } => Provenance::Local,
            Self::Global { .. } | Self::WeakGlobalRef { .. } => Provenance::Global,
            Self::Constant { .. } => Provenance::Constant,
            Self::Random { .. } => Provenance::Random,
            Self::Attribute { base, .. }
            | Self::Index { base, .. }
            | Self::IteratorPosition { base, .. } => base.provenance(),
            Self::Composite { base } => match base.provenance() {
                Provenance::Global | Provenance::GlobalComposite => Provenance::GlobalComposite,
                Provenance::Constant => Provenance::Constant,
                _ => Provenance::LocalComposite,
            },
        }
    }

    #[must_use]
    pub fn base(&self) -> Option<&Rc<Source>> {
        match self {
            Self::Attribute { base, .. }
            | Self::Index { base, .. }
            | Self::IteratorPosition { base, .. }
            | Self::Composite { base } => Some(base),
            Self::Local { .. }
            | Self::Global { .. }
            | Self::Constant { .. }
            | Self::WeakGlobalRef { .. }
            | Self::Random { .. } => None,
        }
    }

    /// Top-level global, or an attribute read directly off one.
    #[must_use]
    pub fn is_global_or_attr_of_global(&self) -> bool {
        match self {
            Self::Global { .. } => true,
            Self::Attribute { base, .. } => matches!(base.as_ref(), Self::Global { .. }),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_random(&self) -> bool {
        matches!(self, Self::Random { .. })
    }

    /// Walks the source path against frame bindings. Constant and random
    /// sources carry no path and resolve to nothing.
    #[must_use]
    pub fn resolve(&self, frame: &FrameBindings) -> Option<Value> {
        match self {
            Self::Local { name } => frame.locals.get(name).cloned(),
            Self::Global { name } | Self::WeakGlobalRef { name } => {
                frame.globals.get(name).cloned()
            }
            Self::Constant { .. } | Self::Random { .. } => None,
            Self::Composite { base } => base.resolve(frame),
            Self::Attribute { base, member } => {
                let parent = base.resolve(frame)?;
                resolve_attr(&parent, member)
            }
            Self::Index { base, key } => {
                let parent = base.resolve(frame)?;
                resolve_index(&parent, key, frame)
            }
            Self::IteratorPosition { base, index } => match base.resolve(frame)? {
                Value::TupleIter(it) => it.items.get(*index).cloned(),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

fn resolve_attr(parent: &Value, member: &str) -> Option<Value> {
    match (parent, member) {
        (Value::Slice(slice), "start") => Some(slice.start.clone()),
        (Value::Slice(slice), "stop") => Some(slice.stop.clone()),
        (Value::Slice(slice), "step") => Some(slice.step.clone()),
        (Value::Range(range), "start") => Some(Value::Int(range.start)),
        (Value::Range(range), "stop") => Some(Value::Int(range.stop)),
        (Value::Range(range), "step") => Some(Value::Int(range.step)),
        (Value::Module(module), _) => lookup_attr(&module.attrs.borrow(), member),
        (Value::Object(object), _) => lookup_attr(&object.attrs.borrow(), member),
        (Value::NamedTuple(nt), _) => nt
            .fields
            .iter()
            .position(|field| field == member)
            .and_then(|idx| nt.values.get(idx).cloned()),
        _ => None,
    }
}

fn lookup_attr(attrs: &[(String, Value)], member: &str) -> Option<Value> {
    attrs
        .iter()
        .find(|(name, _)| name == member)
        .map(|(_, value)| value.clone())
}

fn resolve_index(parent: &Value, key: &IndexKey, frame: &FrameBindings) -> Option<Value> {
    if let Value::Dict(dict) = parent {
        return resolve_dict_key(dict, key, frame);
    }
    let IndexKey::Int(raw) = key else {
        return None;
    };
    let position = usize::try_from(*raw).ok()?;
    match parent {
        Value::Tuple(items) => items.get(position).cloned(),
        Value::List(list) => list.items.borrow().get(position).cloned(),
        Value::NamedTuple(nt) => nt.values.get(position).cloned(),
        Value::Size(dims) => dims.get(position).map(|dim| Value::Int(*dim)),
        _ => None,
    }
}

fn resolve_dict_key(dict: &DictObj, key: &IndexKey, frame: &FrameBindings) -> Option<Value> {
    let key_value = match key {
        IndexKey::Source(source) => source.resolve(frame)?,
        literal => literal.to_literal()?,
    };
    dict.get(&key_value)
}

/// Variable bindings of the frame being traced.
#[derive(Debug, Clone, Default)]
pub struct FrameBindings {
    pub locals: BTreeMap<String, Value>,
    pub globals: BTreeMap<String, Value>,
}

impl FrameBindings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_local(&mut self, name: &str, value: Value) {
        self.locals.insert(name.to_owned(), value);
    }

    pub fn bind_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_owned(), value);
    }
}
