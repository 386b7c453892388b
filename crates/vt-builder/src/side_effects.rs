//! Identity-keyed ledger of mutable objects seen during one pass, plus the
//! mutations recorded against them.

use crate::variable::VarRef;
use rustc_hash::FxHashMap;
use std::fmt;
use std::rc::Rc;
use vt_core::{ObjectId, Source, TraceError, Value};

#[derive(Debug, Clone)]
pub enum Mutation {
    StoreAttr {
        target: ObjectId,
        source: Option<Rc<Source>>,
        name: String,
        value: VarRef,
    },
    ReplaceListContents {
        target: ObjectId,
        source: Option<Rc<Source>>,
        items: Vec<VarRef>,
    },
    SetDictItem {
        target: ObjectId,
        source: Option<Rc<Source>>,
        key: Value,
        value: VarRef,
    },
}

impl Mutation {
    #[must_use]
    pub fn target(&self) -> ObjectId {
        match self {
            Self::StoreAttr { target, .. }
            | Self::ReplaceListContents { target, .. }
            | Self::SetDictItem { target, .. } => *target,
        }
    }
}

fn target_name(target: ObjectId, source: Option<&Rc<Source>>) -> String {
    source.map_or_else(|| format!("<object {target}>"), |source| source.name())
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreAttr {
                target,
                source,
                name,
                value,
            } => write!(
                f,
                "{}.{name} = <{}>",
                target_name(*target, source.as_ref()),
                value.category()
            ),
            Self::ReplaceListContents {
                target,
                source,
                items,
            } => write!(
                f,
                "{}[:] = <{} items>",
                target_name(*target, source.as_ref()),
                items.len()
            ),
            Self::SetDictItem {
                target,
                source,
                key,
                value,
            } => write!(
                f,
                "{}[{}] = <{}>",
                target_name(*target, source.as_ref()),
                key.type_name(),
                value.category()
            ),
        }
    }
}

/// Ordered mutation plan handed to the code generator after tracing.
#[derive(Debug, Clone, Default)]
pub struct MutationReplay {
    pub tracked_objects: usize,
    pub steps: Vec<Mutation>,
}

impl MutationReplay {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn describe(&self) -> Vec<String> {
        self.steps.iter().map(ToString::to_string).collect()
    }
}

#[derive(Debug, Default)]
pub struct SideEffects {
    tracked: FxHashMap<ObjectId, VarRef>,
    mutations: Vec<Mutation>,
}

impl SideEffects {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<VarRef> {
        self.tracked.get(&id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.tracked.contains_key(&id)
    }

    /// Records the variable for `id`, returning the one already tracked if
    /// any.
    pub fn track(&mut self, id: ObjectId, variable: VarRef) -> VarRef {
        Rc::clone(self.tracked.entry(id).or_insert(variable))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    fn tracked_source(
        &self,
        operation: &str,
        object: &Value,
    ) -> Result<(ObjectId, Option<Rc<Source>>), TraceError> {
        let untracked = || {
            TraceError::unrepresentable(
                operation,
                object.type_name(),
                "mutation of an object not tracked in this pass",
            )
        };
        let id = object.identity().ok_or_else(untracked)?;
        let variable = self.tracked.get(&id).ok_or_else(untracked)?;
        Ok((id, variable.source().cloned()))
    }

    pub fn store_attr(
        &mut self,
        object: &Value,
        name: &str,
        value: VarRef,
    ) -> Result<(), TraceError> {
        let (target, source) = self.tracked_source("store_attr", object)?;
        self.mutations.push(Mutation::StoreAttr {
            target,
            source,
            name: name.to_owned(),
            value,
        });
        Ok(())
    }

    pub fn replace_list_contents(
        &mut self,
        list: &Value,
        items: Vec<VarRef>,
    ) -> Result<(), TraceError> {
        if !matches!(list, Value::List(_)) {
            return Err(TraceError::unrepresentable(
                "replace_list_contents",
                list.type_name(),
                "target is not a list",
            ));
        }
        let (target, source) = self.tracked_source("replace_list_contents", list)?;
        self.mutations.push(Mutation::ReplaceListContents {
            target,
            source,
            items,
        });
        Ok(())
    }

    pub fn set_dict_item(
        &mut self,
        dict: &Value,
        key: Value,
        value: VarRef,
    ) -> Result<(), TraceError> {
        if !matches!(dict, Value::Dict(_)) {
            return Err(TraceError::unrepresentable(
                "set_dict_item",
                dict.type_name(),
                "target is not a dict",
            ));
        }
        let (target, source) = self.tracked_source("set_dict_item", dict)?;
        self.mutations.push(Mutation::SetDictItem {
            target,
            source,
            key,
            value,
        });
        Ok(())
    }

    #[must_use]
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Consumes the ledger at the end of the pass.
    #[must_use]
    pub fn into_replay(self) -> MutationReplay {
        MutationReplay {
            tracked_objects: self.tracked.len(),
            steps: self.mutations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SideEffects;
    use crate::variable::{SequenceKind, Variable, VariableKind};
    use std::rc::Rc;
    use vt_core::{GuardSet, ObjectId, Source, Value};

    fn list_var(source: &str) -> crate::variable::VarRef {
        Variable::new(
            VariableKind::Sequence {
                kind: SequenceKind::List,
                items: vec![],
            },
            Some(Source::local(source)),
            GuardSet::new(),
        )
    }

    #[test]
    fn track_keeps_first_variable() {
        let mut ledger = SideEffects::new();
        let first = list_var("xs");
        let kept = ledger.track(ObjectId(1), Rc::clone(&first));
        let again = ledger.track(ObjectId(1), list_var("ys"));
        assert!(Rc::ptr_eq(&kept, &first));
        assert!(Rc::ptr_eq(&again, &first));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn mutations_replay_in_order() {
        let mut ledger = SideEffects::new();
        let xs = Value::list(ObjectId(1), vec![]);
        let cfg = Value::dict(ObjectId(2), vec![]);
        ledger.track(ObjectId(1), list_var("xs"));
        ledger.track(ObjectId(2), list_var("cfg"));
        ledger
            .replace_list_contents(&xs, vec![Variable::constant(Value::Int(1))])
            .expect("tracked list");
        ledger
            .set_dict_item(&cfg, Value::str("lr"), Variable::constant(Value::Float(0.1)))
            .expect("tracked dict");
        let replay = ledger.into_replay();
        assert_eq!(replay.tracked_objects, 2);
        assert_eq!(
            replay.describe(),
            vec!["L['xs'][:] = <1 items>".to_owned(), "L['cfg'][str] = <constant>".to_owned()]
        );
    }

    #[test]
    fn untracked_targets_are_unrepresentable() {
        let mut ledger = SideEffects::new();
        let obj = Value::object(ObjectId(5), "Config");
        let err = ledger
            .store_attr(&obj, "lr", Variable::constant(Value::Int(1)))
            .expect_err("untracked");
        assert!(err.is_recoverable());
        assert!(ledger.mutations().is_empty());
    }
}
