// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Component tree model and loader.
//!
//! The tree is read once at startup from a JSON document:
//!
//! ```json
//! {
//!   "root": {
//!     "name": "svc",
//!     "branch": {
//!       "children": [
//!         { "name": "worker", "leaf": { "image": "acme/worker:1", "id": "w-1", "path": "components/worker" } }
//!       ]
//!     }
//!   }
//! }
//! ```
//!
//! Branches only group; every leaf is a deployable workload. [`flatten`] turns the
//! tree into a flat list without touching any shared state.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors from loading a component tree.
#[derive(Debug, Error)]
pub enum TreeError {
    /// The tree source could not be read.
    #[error("component tree {path} unreadable: {source}")]
    ConfigUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The tree source is not a valid component tree.
    #[error("component tree malformed: {0}")]
    ConfigMalformed(String),
}

/// Node of the component tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentNode {
    pub name: String,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Branch { children: Vec<ComponentNode> },
    Leaf(LeafSpec),
}

/// What a leaf deploys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeafSpec {
    /// Image reference of the workload (e.g. `acme/worker:1`)
    pub workload_ref: String,
    /// Opaque identifier carried over from the tree source
    pub external_id: String,
    /// Location of the component's sources, informational
    pub path: Option<String>,
}

impl ComponentNode {
    pub fn branch(name: impl Into<String>, children: Vec<ComponentNode>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Branch { children },
        }
    }

    pub fn leaf(
        name: impl Into<String>,
        workload_ref: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Leaf(LeafSpec {
                workload_ref: workload_ref.into(),
                external_id: external_id.into(),
                path: None,
            }),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }
}

/// A leaf with its position in the tree resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatComponent {
    pub name: String,
    /// Ancestor branch names joined with `.`; empty for a root leaf
    pub group: String,
    pub workload_ref: String,
    pub external_id: String,
    pub path: Option<String>,
}

/// Flatten a tree into its leaves, depth-first, in document order.
pub fn flatten(root: &ComponentNode) -> Vec<FlatComponent> {
    let mut out = Vec::new();
    let mut ancestors = Vec::new();
    walk(root, &mut ancestors, &mut out);
    out
}

fn walk<'a>(node: &'a ComponentNode, ancestors: &mut Vec<&'a str>, out: &mut Vec<FlatComponent>) {
    match &node.kind {
        NodeKind::Branch { children } => {
            ancestors.push(&node.name);
            for child in children {
                walk(child, ancestors, out);
            }
            ancestors.pop();
        }
        NodeKind::Leaf(leaf) => out.push(FlatComponent {
            name: node.name.clone(),
            group: ancestors.join("."),
            workload_ref: leaf.workload_ref.clone(),
            external_id: leaf.external_id.clone(),
            path: leaf.path.clone(),
        }),
    }
}

/// Load a component tree from a JSON file.
pub fn load_component_tree(path: impl AsRef<Path>) -> Result<ComponentNode, TreeError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|source| TreeError::ConfigUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    parse_component_tree(&source)
}

/// Parse a component tree from a JSON document.
pub fn parse_component_tree(source: &str) -> Result<ComponentNode, TreeError> {
    let file: TreeFile =
        serde_json::from_str(source).map_err(|e| TreeError::ConfigMalformed(e.to_string()))?;
    file.root.into_node()
}

#[derive(Deserialize)]
struct TreeFile {
    root: RawNode,
}

#[derive(Deserialize)]
struct RawNode {
    name: String,
    #[serde(default)]
    branch: Option<RawBranch>,
    #[serde(default)]
    leaf: Option<RawLeaf>,
}

#[derive(Deserialize)]
struct RawBranch {
    #[serde(default)]
    children: Vec<RawNode>,
}

#[derive(Deserialize)]
struct RawLeaf {
    #[serde(alias = "tag")]
    image: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    path: Option<String>,
}

impl RawNode {
    fn into_node(self) -> Result<ComponentNode, TreeError> {
        if self.name.trim().is_empty() {
            return Err(TreeError::ConfigMalformed(
                "component with empty name".to_string(),
            ));
        }

        let kind = match (self.branch, self.leaf) {
            (Some(branch), None) => NodeKind::Branch {
                children: branch
                    .children
                    .into_iter()
                    .map(RawNode::into_node)
                    .collect::<Result<_, _>>()?,
            },
            (None, Some(leaf)) => {
                if leaf.image.trim().is_empty() {
                    return Err(TreeError::ConfigMalformed(format!(
                        "leaf '{}' has no image",
                        self.name
                    )));
                }
                NodeKind::Leaf(LeafSpec {
                    workload_ref: leaf.image,
                    external_id: leaf.id,
                    path: leaf.path,
                })
            }
            (Some(_), Some(_)) => {
                return Err(TreeError::ConfigMalformed(format!(
                    "'{}' is both a branch and a leaf",
                    self.name
                )));
            }
            (None, None) => {
                return Err(TreeError::ConfigMalformed(format!(
                    "'{}' is neither a branch nor a leaf",
                    self.name
                )));
            }
        };

        Ok(ComponentNode {
            name: self.name,
            kind,
        })
    }
}
