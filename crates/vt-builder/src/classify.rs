//! Allow-list and skip classification of callables and module types.

use std::collections::BTreeSet;
use std::fmt;
use vt_core::{FunctionKind, Value};

/// Pure predicates the wrapper consults; implementations never mutate.
pub trait ValueClassifier: fmt::Debug {
    /// Library callable or class the tracer models directly.
    fn is_allowed(&self, value: &Value) -> bool;
    fn is_builtin_callable(&self, value: &Value) -> bool;
    /// Module type whose instances may be registered as sub-components.
    fn is_traceable_module_type(&self, type_name: &str) -> bool;
    /// Source file the tracer must not inline into.
    fn is_skipped_file(&self, file: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct DefaultClassifier {
    allowed_roots: BTreeSet<String>,
    builtin_roots: BTreeSet<String>,
    skip_markers: Vec<String>,
    untraceable_module_types: BTreeSet<String>,
}

impl Default for DefaultClassifier {
    fn default() -> Self {
        Self {
            allowed_roots: ["torch"].into_iter().map(str::to_owned).collect(),
            builtin_roots: ["builtins", "math", "operator"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            skip_markers: ["/site-packages/", "/lib/python3", "<frozen"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            untraceable_module_types: BTreeSet::new(),
        }
    }
}

impl DefaultClassifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn allow_module(mut self, root: &str) -> Self {
        self.allowed_roots.insert(root.to_owned());
        self
    }

    #[must_use]
    pub fn skip_files_containing(mut self, marker: &str) -> Self {
        self.skip_markers.push(marker.to_owned());
        self
    }

    #[must_use]
    pub fn untraceable_module_type(mut self, type_name: &str) -> Self {
        self.untraceable_module_types.insert(type_name.to_owned());
        self
    }
}

fn root_module(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}

impl ValueClassifier for DefaultClassifier {
    fn is_allowed(&self, value: &Value) -> bool {
        match value {
            Value::Function(function) => {
                function.kind == FunctionKind::Function
                    && self.allowed_roots.contains(root_module(&function.module))
            }
            Value::Class(class) => self.allowed_roots.contains(root_module(&class.module)),
            _ => false,
        }
    }

    fn is_builtin_callable(&self, value: &Value) -> bool {
        match value {
            Value::Function(function) => {
                function.kind == FunctionKind::Function
                    && self.builtin_roots.contains(root_module(&function.module))
            }
            _ => false,
        }
    }

    fn is_traceable_module_type(&self, type_name: &str) -> bool {
        !self.untraceable_module_types.contains(type_name)
    }

    fn is_skipped_file(&self, file: &str) -> bool {
        self.skip_markers.iter().any(|marker| file.contains(marker.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::{DefaultClassifier, ValueClassifier};
    use std::rc::Rc;
    use vt_core::{FunctionKind, FunctionObj, ObjectId, Value};

    fn function(module: &str, kind: FunctionKind) -> Value {
        Value::Function(Rc::new(FunctionObj {
            id: ObjectId(1),
            module: module.to_owned(),
            qualname: "f".to_owned(),
            file: "/app/model.py".to_owned(),
            kind,
            force_inline: false,
        }))
    }

    #[test]
    fn allow_list_matches_root_package() {
        let classifier = DefaultClassifier::new();
        assert!(classifier.is_allowed(&function("torch.nn.functional", FunctionKind::Function)));
        assert!(!classifier.is_allowed(&function("mylib", FunctionKind::Function)));
        let extended = DefaultClassifier::new().allow_module("mylib");
        assert!(extended.is_allowed(&function("mylib.ops", FunctionKind::Function)));
    }

    #[test]
    fn builtins_come_from_builtin_roots() {
        let classifier = DefaultClassifier::new();
        assert!(!classifier.is_builtin_callable(&function("", FunctionKind::Operator)));
        assert!(!classifier.is_builtin_callable(&function("operator", FunctionKind::Operator)));
        assert!(classifier.is_builtin_callable(&function("operator", FunctionKind::Function)));
        assert!(classifier.is_builtin_callable(&function("math", FunctionKind::Function)));
        assert!(!classifier.is_builtin_callable(&function("app", FunctionKind::Function)));
    }

    #[test]
    fn skip_markers_and_module_types() {
        let classifier = DefaultClassifier::new()
            .skip_files_containing("/vendor/")
            .untraceable_module_type("ScriptModule");
        assert!(classifier.is_skipped_file("/usr/lib/python3.11/inspect.py"));
        assert!(classifier.is_skipped_file("/app/vendor/x.py"));
        assert!(!classifier.is_skipped_file("/app/model.py"));
        assert!(!classifier.is_traceable_module_type("ScriptModule"));
        assert!(classifier.is_traceable_module_type("Linear"));
    }
}
