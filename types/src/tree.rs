//! Vault tree listing as returned by the document server.

use serde::{Deserialize, Serialize};

use crate::DocKey;

/// One node of the vault tree. Folders carry children, files are leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub key: String,
    pub title: String,
    pub is_leaf: bool,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub children: Vec<TreeNode>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<TreeNode>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<TreeNode>>::deserialize(deserializer)?.unwrap_or_default())
}

impl TreeNode {
    /// Document keys of every leaf under this node, depth first.
    ///
    /// Leaves whose key does not form a valid [`DocKey`] are skipped.
    #[must_use]
    pub fn leaf_keys(&self) -> Vec<DocKey> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut Vec<DocKey>) {
        if self.is_leaf {
            if let Ok(key) = DocKey::new(&self.key) {
                out.push(key);
            }
            return;
        }
        for child in &self.children {
            child.collect_leaves(out);
        }
    }
}

/// Flatten a forest of nodes into document keys, depth first.
#[must_use]
pub fn leaf_keys(nodes: &[TreeNode]) -> Vec<DocKey> {
    nodes.iter().flat_map(TreeNode::leaf_keys).collect()
}
