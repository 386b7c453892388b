#![forbid(unsafe_code)]

//! Trace graph recorded while wrapping inputs and running traced code.
//!
//! Nodes are append-only. Each node has one example-value slot that may be
//! written once.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use vt_core::{Literal, OpTarget, TensorObj, TraceError};
use vt_fake::FakeValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atom {
    Node(NodeId),
    Lit(Literal),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeOp {
    Placeholder {
        type_name: String,
    },
    /// Reads a named sub-component registered on the compiled artifact.
    GetAttr {
        qualified_name: String,
    },
    Call {
        target: OpTarget,
        args: SmallVec<[Atom; 4]>,
        params: BTreeMap<String, String>,
    },
    GetItem {
        base: NodeId,
        index: usize,
    },
}

impl NodeOp {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Placeholder { .. } => "placeholder",
            Self::GetAttr { .. } => "get_attr",
            Self::Call { .. } => "call_function",
            Self::GetItem { .. } => "getitem",
        }
    }

    /// Operation identity used in diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Placeholder { type_name } => format!("placeholder {type_name}"),
            Self::GetAttr { qualified_name } => format!("get_attr {qualified_name}"),
            Self::Call { target, .. } => format!("call_function {target}"),
            Self::GetItem { index, .. } => format!("call_function getitem[{index}]"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    name: String,
    op: NodeOp,
    example: Option<FakeValue>,
}

impl Node {
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn op(&self) -> &NodeOp {
        &self.op
    }

    #[must_use]
    pub fn example(&self) -> Option<&FakeValue> {
        self.example.as_ref()
    }

    /// Call target, if this node calls one. Index nodes report `GetItem`.
    #[must_use]
    pub fn target(&self) -> Option<&OpTarget> {
        match &self.op {
            NodeOp::Call { target, .. } => Some(target),
            NodeOp::GetItem { .. } => Some(&OpTarget::GetItem),
            NodeOp::Placeholder { .. } | NodeOp::GetAttr { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    UnknownNode { id: NodeId },
    DuplicateExampleValue { node: String },
    ForwardReference { node: String, arg: NodeId },
    DuplicateName { name: String },
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownNode { id } => write!(f, "unknown graph node n{}", id.0),
            Self::DuplicateExampleValue { node } => {
                write!(f, "node {node} already has an example value")
            }
            Self::ForwardReference { node, arg } => {
                write!(f, "node {node} references later node n{}", arg.0)
            }
            Self::DuplicateName { name } => write!(f, "duplicate node name {name}"),
        }
    }
}

impl std::error::Error for GraphError {}

impl From<GraphError> for TraceError {
    fn from(value: GraphError) -> Self {
        TraceError::invariant(value.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TraceGraph {
    nodes: Vec<Node>,
    names: BTreeSet<String>,
    real_values: FxHashMap<NodeId, TensorObj>,
}

/// Replaces every run of non-alphanumeric characters with `_`.
#[must_use]
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

impl TraceGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn unique_name(&mut self, base: &str) -> String {
        let base = if base.is_empty() { "_" } else { base };
        let mut candidate = base.to_owned();
        let mut suffix = 1_u32;
        while self.names.contains(&candidate) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        self.names.insert(candidate.clone());
        candidate
    }

    fn push(&mut self, name_hint: &str, op: NodeOp) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        let name = self.unique_name(&sanitize_name(name_hint));
        self.nodes.push(Node {
            id,
            name,
            op,
            example: None,
        });
        id
    }

    fn check_exists(&self, id: NodeId) -> Result<(), GraphError> {
        if (id.0 as usize) < self.nodes.len() {
            Ok(())
        } else {
            Err(GraphError::UnknownNode { id })
        }
    }

    /// New input slot named after `name`, deduplicated with numeric suffixes.
    pub fn create_graph_input(&mut self, name: &str, type_name: &str) -> NodeId {
        self.push(
            name,
            NodeOp::Placeholder {
                type_name: type_name.to_owned(),
            },
        )
    }

    pub fn create_get_attr(&mut self, qualified_name: &str) -> NodeId {
        self.push(
            qualified_name,
            NodeOp::GetAttr {
                qualified_name: qualified_name.to_owned(),
            },
        )
    }

    pub fn create_call(
        &mut self,
        target: OpTarget,
        args: SmallVec<[Atom; 4]>,
        params: BTreeMap<String, String>,
    ) -> Result<NodeId, GraphError> {
        for atom in &args {
            if let Atom::Node(id) = atom {
                self.check_exists(*id)?;
            }
        }
        let hint = target.as_str().to_owned();
        Ok(self.push(
            &hint,
            NodeOp::Call {
                target,
                args,
                params,
            },
        ))
    }

    pub fn create_getitem(&mut self, base: NodeId, index: usize) -> Result<NodeId, GraphError> {
        self.check_exists(base)?;
        Ok(self.push("getitem", NodeOp::GetItem { base, index }))
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(GraphError::UnknownNode { id })
    }

    #[must_use]
    pub fn example(&self, id: NodeId) -> Option<&FakeValue> {
        self.nodes.get(id.0 as usize).and_then(Node::example)
    }

    /// Writes the example-value slot of `id`; a second write is rejected.
    pub fn set_example(&mut self, id: NodeId, value: FakeValue) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id.0 as usize)
            .ok_or(GraphError::UnknownNode { id })?;
        if node.example.is_some() {
            return Err(GraphError::DuplicateExampleValue {
                node: node.name.clone(),
            });
        }
        node.example = Some(value);
        Ok(())
    }

    /// Keeps a copy of the real tensor seen at `id` (export mode).
    pub fn cache_real_value(&mut self, id: NodeId, tensor: TensorObj) -> Result<(), GraphError> {
        self.check_exists(id)?;
        self.real_values.insert(id, tensor);
        Ok(())
    }

    #[must_use]
    pub fn real_value(&self, id: NodeId) -> Option<&TensorObj> {
        self.real_values.get(&id)
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|node| matches!(node.op, NodeOp::Placeholder { .. }))
    }

    #[must_use]
    pub fn canonical_fingerprint(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            let _ = write!(&mut out, "{}={}", node.name, node.op.kind());
            match &node.op {
                NodeOp::Placeholder { type_name } => {
                    let _ = write!(&mut out, "<{type_name}>");
                }
                NodeOp::GetAttr { qualified_name } => {
                    let _ = write!(&mut out, "<{qualified_name}>");
                }
                NodeOp::Call {
                    target,
                    args,
                    params,
                } => {
                    let _ = write!(&mut out, "<{target}>(");
                    for atom in args {
                        match atom {
                            Atom::Node(id) => {
                                let _ = write!(&mut out, "n{},", id.0);
                            }
                            Atom::Lit(lit) => {
                                let _ = write!(&mut out, "{lit:?},");
                            }
                        }
                    }
                    out.push(')');
                    out.push('{');
                    for (key, value) in params {
                        let _ = write!(&mut out, "{key}={value};");
                    }
                    out.push('}');
                }
                NodeOp::GetItem { base, index } => {
                    let _ = write!(&mut out, "(n{},{index})", base.0);
                }
            }
            out.push('|');
        }
        out
    }

    pub fn validate_well_formed(&self) -> Result<(), GraphError> {
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(GraphError::DuplicateName {
                    name: node.name.clone(),
                });
            }
            let refs: SmallVec<[NodeId; 4]> = match &node.op {
                NodeOp::Call { args, .. } => args
                    .iter()
                    .filter_map(|atom| match atom {
                        Atom::Node(id) => Some(*id),
                        Atom::Lit(_) => None,
                    })
                    .collect(),
                NodeOp::GetItem { base, .. } => smallvec::smallvec![*base],
                NodeOp::Placeholder { .. } | NodeOp::GetAttr { .. } => SmallVec::new(),
            };
            if let Some(arg) = refs.into_iter().find(|arg| arg.0 >= node.id.0) {
                return Err(GraphError::ForwardReference {
                    node: node.name.clone(),
                    arg,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Atom, GraphError, NodeOp, TraceGraph, sanitize_name};
    use smallvec::smallvec;
    use std::collections::BTreeMap;
    use vt_core::{Literal, OpTarget, TraceError};
    use vt_fake::FakeValue;

    #[test]
    fn input_names_are_sanitized_and_unique() {
        let mut graph = TraceGraph::new();
        let a = graph.create_graph_input("L['x']", "Tensor");
        let b = graph.create_graph_input("L['x']", "Tensor");
        assert_eq!(graph.node(a).expect("node").name(), "L_x_");
        assert_eq!(graph.node(b).expect("node").name(), "L_x__1");
        assert_eq!(sanitize_name("G['cfg'].lr"), "G_cfg_lr");
        assert_eq!(graph.placeholders().count(), 2);
    }

    #[test]
    fn call_ops_serialize_with_inline_args() {
        let op = NodeOp::Call {
            target: OpTarget::Add,
            args: smallvec![Atom::Node(super::NodeId(0)), Atom::Lit(Literal::I64(2))],
            params: BTreeMap::from([("alpha".to_owned(), "1".to_owned())]),
        };
        let encoded = serde_json::to_string(&op).expect("serialize");
        let decoded: NodeOp = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, op);
        assert_eq!(decoded.kind(), "call_function");
    }

    #[test]
    fn example_slot_is_write_once() {
        let mut graph = TraceGraph::new();
        let x = graph.create_graph_input("x", "int");
        graph.set_example(x, FakeValue::Int(3)).expect("first write");
        let err = graph
            .set_example(x, FakeValue::Int(4))
            .expect_err("second write");
        assert_eq!(
            err,
            GraphError::DuplicateExampleValue {
                node: "x".to_owned()
            }
        );
        let trace_err: TraceError = err.into();
        assert!(!trace_err.is_recoverable());
        assert_eq!(graph.example(x), Some(&FakeValue::Int(3)));
    }

    #[test]
    fn calls_reject_unknown_nodes() {
        let mut graph = TraceGraph::new();
        let err = graph
            .create_call(
                OpTarget::Neg,
                smallvec![Atom::Node(super::NodeId(5))],
                BTreeMap::new(),
            )
            .expect_err("unknown arg");
        assert!(matches!(err, GraphError::UnknownNode { .. }));
    }

    #[test]
    fn fingerprint_tracks_structure() {
        let mut graph = TraceGraph::new();
        let x = graph.create_graph_input("x", "Tensor");
        let y = graph
            .create_call(
                OpTarget::Add,
                smallvec![Atom::Node(x), Atom::Lit(Literal::I64(1))],
                BTreeMap::new(),
            )
            .expect("call");
        graph.create_getitem(y, 0).expect("getitem");
        let before = graph.canonical_fingerprint();
        assert_eq!(before, graph.clone().canonical_fingerprint());
        assert!(graph.validate_well_formed().is_ok());
        graph.create_get_attr("self.weight");
        assert_ne!(before, graph.canonical_fingerprint());
        assert!(matches!(
            graph.node(y).expect("node").op(),
            NodeOp::Call { .. }
        ));
    }
}
