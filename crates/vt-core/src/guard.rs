//! Guard predicates and the synthesizer that produces them.
//!
//! [`make_guards`] is the only constructor of [`Guard`]; guards on
//! constant-provenance sources are never produced.

use crate::source::Source;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardKind {
    TypeMatch,
    EqualsMatch,
    LengthMatch,
    DictKeys,
    TensorMatch,
    IdMatch,
    ConstantMatch,
    NameMatch,
    FunctionMatch,
    ModuleMatch,
}

impl GuardKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TypeMatch => "TYPE_MATCH",
            Self::EqualsMatch => "EQUALS_MATCH",
            Self::LengthMatch => "LIST_LENGTH",
            Self::DictKeys => "DICT_KEYS",
            Self::TensorMatch => "TENSOR_MATCH",
            Self::IdMatch => "ID_MATCH",
            Self::ConstantMatch => "CONSTANT_MATCH",
            Self::NameMatch => "NAME_MATCH",
            Self::FunctionMatch => "FUNCTION_MATCH",
            Self::ModuleMatch => "MODULE_MATCH",
        }
    }
}

impl fmt::Display for GuardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guard {
    source: Rc<Source>,
    kind: GuardKind,
}

impl Guard {
    #[must_use]
    pub fn source(&self) -> &Rc<Source> {
        &self.source
    }

    #[must_use]
    pub fn kind(&self) -> GuardKind {
        self.kind
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source.name(), self.kind)
    }
}

pub type GuardSet = BTreeSet<Guard>;

/// One guard per requested kind on `source`, or `None` when the source is
/// constant-provenance.
#[must_use]
pub fn make_guards(source: &Rc<Source>, kinds: &[GuardKind]) -> Option<GuardSet> {
    if source.provenance().is_constant() {
        return None;
    }
    Some(
        kinds
            .iter()
            .map(|kind| Guard {
                source: Rc::clone(source),
                kind: *kind,
            })
            .collect(),
    )
}

/// Union of several guard sets.
#[must_use]
pub fn union_guards<'a, I>(sets: I) -> GuardSet
where
    I: IntoIterator<Item = &'a GuardSet>,
{
    let mut out = GuardSet::new();
    for set in sets {
        out.extend(set.iter().cloned());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{GuardKind, make_guards, union_guards};
    use crate::source::Source;

    #[test]
    fn constant_sources_are_never_guarded() {
        let c = Source::constant("const_0");
        assert!(make_guards(&c, &[GuardKind::TensorMatch]).is_none());
        assert!(make_guards(&Source::item(&c, 0), &[GuardKind::EqualsMatch]).is_none());
    }

    #[test]
    fn one_guard_per_kind() {
        let x = Source::local("x");
        let guards = make_guards(&x, &[GuardKind::TypeMatch, GuardKind::LengthMatch])
            .expect("local sources are guardable");
        assert_eq!(guards.len(), 2);
        assert!(guards.iter().all(|guard| guard.source() == &x));
    }

    #[test]
    fn union_deduplicates() {
        let x = Source::local("x");
        let a = make_guards(&x, &[GuardKind::TypeMatch]).expect("guardable");
        let b = make_guards(&x, &[GuardKind::TypeMatch, GuardKind::IdMatch]).expect("guardable");
        let all = union_guards([&a, &b]);
        assert_eq!(all.len(), 2);
        let rendered = all.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(rendered, vec!["L['x']:TYPE_MATCH", "L['x']:ID_MATCH"]);
    }

    #[test]
    fn kinds_serialize_snake_case() {
        let encoded = serde_json::to_string(&GuardKind::TensorMatch).expect("serialize");
        assert_eq!(encoded, "\"tensor_match\"");
    }
}
