//! Plan printing and plan fingerprinting.

use std::fmt::Write as _;
use std::hash::Hasher;

use serde::Serialize;
use xxhash_rust::xxh64::Xxh64;

/// Explain node describing one operator and its inputs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExplainNode {
    /// Operator name.
    pub op: String,
    /// Operator parameters.
    pub props: Vec<ExplainProp>,
    /// Child operators.
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a node with no properties or inputs.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// Adds a structural property.
    pub fn prop(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.props.push(ExplainProp::plain(key, value.to_string()));
        self
    }

    /// Adds a property carrying user literals.
    pub fn literal(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.props.push(ExplainProp::literal(key, value.to_string()));
        self
    }

    /// Appends a child node.
    pub fn input(mut self, child: ExplainNode) -> Self {
        self.inputs.push(child);
        self
    }

    /// One line per operator, two spaces of indentation per depth.
    pub fn render(&self) -> String {
        self.render_with(false)
    }

    /// Like [`ExplainNode::render`], optionally hiding literal values.
    pub fn render_with(&self, redact: bool) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0, redact);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize, redact: bool) {
        for _ in 0..depth {
            out.push_str("  ");
        }
        out.push_str(&self.op);
        if !self.props.is_empty() {
            out.push_str(" [");
            for (idx, prop) in self.props.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                let value = if redact && prop.redactable {
                    "?"
                } else {
                    prop.value.as_str()
                };
                let _ = write!(out, "{}={}", prop.key, value);
            }
            out.push(']');
        }
        out.push('\n');
        for child in &self.inputs {
            child.render_into(out, depth + 1, redact);
        }
    }

    /// Deterministic xxh64 hash of the plan shape; literal values are left
    /// out so plans differing only in constants share a fingerprint.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        hash_node(self, &mut hasher);
        hasher.finish()
    }

    /// Number of operators in the tree, the root included.
    pub fn operator_count(&self) -> usize {
        1 + self.inputs.iter().map(ExplainNode::operator_count).sum::<usize>()
    }
}

fn hash_node(node: &ExplainNode, hasher: &mut Xxh64) {
    hasher.write(node.op.as_bytes());
    for prop in &node.props {
        hasher.write(prop.key.as_bytes());
        if !prop.redactable {
            hasher.write(prop.value.as_bytes());
        }
    }
    hasher.write_u64(node.inputs.len() as u64);
    for child in &node.inputs {
        hash_node(child, hasher);
    }
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
    /// Whether the value holds literal data that may be redacted.
    pub redactable: bool,
}

impl ExplainProp {
    fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }
}
