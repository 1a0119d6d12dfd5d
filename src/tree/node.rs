//! The in-memory node hierarchy and its JSON form.

use std::collections::HashSet;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::constants::NO_MATCH_REG;
use crate::constants::NS_SEPARATOR;
use crate::constants::ROOT_ID;
use crate::constants::ROOT_NAME;

/// Kind of a node. Serialized as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Leaf,
    NonLeaf,
    Root,
}

impl NodeType {
    pub fn as_int(self) -> u8 {
        match self {
            NodeType::Leaf => 0,
            NodeType::NonLeaf => 1,
            NodeType::Root => 2,
        }
    }

    pub fn from_int(value: u8) -> Option<Self> {
        match value {
            0 => Some(NodeType::Leaf),
            1 => Some(NodeType::NonLeaf),
            2 => Some(NodeType::Root),
            _ => None,
        }
    }
}

impl Serialize for NodeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_int())
    }
}

impl<'de> Deserialize<'de> for NodeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        NodeType::from_int(value).ok_or_else(|| serde::de::Error::custom(format!("unknown node type {value}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Comment", default)]
    pub comment: String,
    #[serde(rename = "Type")]
    pub node_type: NodeType,
    #[serde(rename = "MachineReg", default)]
    pub machine_reg: String,
    #[serde(rename = "Children", default)]
    pub children: Vec<Node>,
}

/// A leaf as seen from a walk: where it is and how hosts are matched to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
    pub ns: String,
    pub id: String,
    pub machine_reg: String,
}

/// Joins a child name onto its parent's NS.
pub fn child_ns(name: &str, parent_ns: &str) -> String {
    format!("{name}{NS_SEPARATOR}{parent_ns}")
}

impl Node {
    /// The root is stored with its own type tag but is never a leaf, so it
    /// holds template lists like any other non-leaf.
    pub fn root() -> Self {
        Self {
            id: ROOT_ID.to_string(),
            name: ROOT_NAME.to_string(),
            comment: "root node".to_string(),
            node_type: NodeType::Root,
            machine_reg: NO_MATCH_REG.to_string(),
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.node_type == NodeType::Leaf
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Looks up `ns` below this root. Segments are matched right to left; the
    /// rightmost one must be this node's name.
    pub fn get_by_ns(&self, ns: &str) -> Option<&Node> {
        let mut segments = ns.rsplit(NS_SEPARATOR);
        if segments.next()? != self.name {
            return None;
        }
        segments.try_fold(self, |node, segment| node.child(segment))
    }

    pub fn get_by_ns_mut(&mut self, ns: &str) -> Option<&mut Node> {
        let mut segments = ns.rsplit(NS_SEPARATOR);
        if segments.next()? != self.name {
            return None;
        }
        segments.try_fold(self, |node, segment| node.children.iter_mut().find(|c| c.name == segment))
    }

    /// Depth-first search by id. Returns the node and its NS.
    pub fn get_by_id(&self, id: &str) -> Option<(&Node, String)> {
        self.find_id(id, &self.name)
    }

    fn find_id<'a>(&'a self, id: &str, ns: &str) -> Option<(&'a Node, String)> {
        if self.id == id {
            return Some((self, ns.to_string()));
        }
        self.children
            .iter()
            .find_map(|child| child.find_id(id, &child_ns(&child.name, ns)))
    }

    /// Pre-order walk calling `visit(node, ns)` on this node and everything below.
    pub fn walk<'a>(&'a self, ns: &str, visit: &mut impl FnMut(&'a Node, &str)) {
        visit(self, ns);
        for child in &self.children {
            child.walk(&child_ns(&child.name, ns), visit);
        }
    }

    /// Every leaf at or below this node, in depth-first order. `ns` is this
    /// node's own NS.
    pub fn leaves(&self, ns: &str) -> Vec<LeafInfo> {
        let mut out = Vec::new();
        self.walk(ns, &mut |node, node_ns| {
            if node.is_leaf() {
                out.push(LeafInfo {
                    ns: node_ns.to_string(),
                    id: node.id.clone(),
                    machine_reg: node.machine_reg.clone(),
                });
            }
        });
        out
    }

    /// Every NS at or below this node.
    pub fn all_ns(&self, ns: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.walk(ns, &mut |_, node_ns| out.push(node_ns.to_string()));
        out
    }

    /// Detaches the direct child called `name`.
    pub fn remove_child(&mut self, name: &str) -> Option<Node> {
        let at = self.children.iter().position(|c| c.name == name)?;
        Some(self.children.remove(at))
    }

    /// Checks the structural invariants: one root at the top, leaves without
    /// children, and no two siblings sharing a name (which makes every NS
    /// unique).
    pub fn check(&self) -> Result<(), String> {
        if self.node_type != NodeType::Root {
            return Err(format!("top node {} is not the root", self.name));
        }
        let mut ids = HashSet::new();
        let mut problem = None;
        self.walk(&self.name, &mut |node, ns| {
            if problem.is_some() {
                return;
            }
            if !ids.insert(node.id.as_str()) {
                problem = Some(format!("duplicate id {} at {ns}", node.id));
            } else if node.is_leaf() && !node.children.is_empty() {
                problem = Some(format!("leaf {ns} has children"));
            } else if node.node_type == NodeType::Root && ns != self.name {
                problem = Some(format!("nested root at {ns}"));
            } else {
                let mut names = HashSet::new();
                if let Some(dup) = node.children.iter().find(|c| !names.insert(c.name.as_str())) {
                    problem = Some(format!("duplicate ns {}", child_ns(&dup.name, ns)));
                }
            }
        });
        match problem {
            Some(p) => Err(p),
            None => Ok(()),
        }
    }
}

/// Reverses the segments of an NS: `a.b.loda` becomes `loda.b.a`.
pub fn reverse_ns(ns: &str) -> String {
    ns.rsplit(NS_SEPARATOR).collect::<Vec<_>>().join(".")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn node(id: &str, name: &str, node_type: NodeType, children: Vec<Node>) -> Node {
        Node {
            id: id.to_string(),
            name: name.to_string(),
            comment: String::new(),
            node_type,
            machine_reg: NO_MATCH_REG.to_string(),
            children,
        }
    }

    #[test]
    fn test_root_is_not_a_leaf() {
        let root = Node::root();
        assert_eq!(root.node_type, NodeType::Root);
        assert!(!root.is_leaf());
    }

    fn sample() -> Node {
        let mut root = Node::root();
        root.children = vec![
            node("p", "pool", NodeType::Leaf, vec![]),
            node("w", "web", NodeType::NonLeaf, vec![
                node("a", "api", NodeType::Leaf, vec![]),
                node("f", "front", NodeType::Leaf, vec![]),
            ]),
        ];
        root
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(node("x", "n", NodeType::NonLeaf, vec![])).unwrap();
        assert_eq!(json["ID"], "x");
        assert_eq!(json["Name"], "n");
        assert_eq!(json["Type"], 1);
        assert_eq!(json["MachineReg"], "^$");
        assert!(json["Children"].as_array().unwrap().is_empty());
        assert!(serde_json::from_str::<NodeType>("7").is_err());
    }

    #[test]
    fn test_get_by_ns() {
        let root = sample();
        assert_eq!(root.get_by_ns("loda").unwrap().id, "0");
        assert_eq!(root.get_by_ns("api.web.loda").unwrap().id, "a");
        assert!(root.get_by_ns("api.loda").is_none());
        assert!(root.get_by_ns("web.other").is_none());
        assert!(root.get_by_ns("").is_none());
    }

    #[test]
    fn test_get_by_id_builds_ns() {
        let root = sample();
        let (n, ns) = root.get_by_id("f").unwrap();
        assert_eq!(n.name, "front");
        assert_eq!(ns, "front.web.loda");
        assert!(root.get_by_id("missing").is_none());
    }

    #[test]
    fn test_leaves_in_dfs_order() {
        let root = sample();
        let leaves: Vec<String> = root.leaves("loda").into_iter().map(|l| l.ns).collect();
        assert_eq!(leaves, vec!["pool.loda", "api.web.loda", "front.web.loda"]);
        let web = root.get_by_ns("web.loda").unwrap();
        assert_eq!(web.leaves("web.loda").len(), 2);
        let api = root.get_by_ns("api.web.loda").unwrap();
        assert_eq!(api.leaves("api.web.loda")[0].id, "a");
    }

    #[test]
    fn test_check_rejects_duplicates() {
        let mut root = sample();
        assert!(root.check().is_ok());
        root.children.push(node("q", "pool", NodeType::Leaf, vec![]));
        assert!(root.check().is_err());
    }

    #[test]
    fn test_reverse_ns() {
        assert_eq!(reverse_ns("server1.product1.loda"), "loda.product1.server1");
        assert_eq!(reverse_ns("loda"), "loda");
    }

    fn arb_tree() -> impl Strategy<Value = Node> {
        let leaf = "[a-z]{1,6}".prop_map(|name| node("", &name, NodeType::Leaf, vec![]));
        let inner = leaf.prop_recursive(3, 24, 4, |child| {
            ("[a-z]{1,6}", prop::collection::vec(child, 0..4))
                .prop_map(|(name, children)| node("", &name, NodeType::NonLeaf, children))
        });
        prop::collection::vec(inner, 0..4).prop_map(|children| {
            let mut root = Node::root();
            root.children = children;
            dedup(&mut root);
            let mut next = 0;
            assign_ids(&mut root, &mut next);
            root
        })
    }

    fn dedup(node: &mut Node) {
        let mut seen = HashSet::new();
        node.children.retain(|c| seen.insert(c.name.clone()));
        for child in &mut node.children {
            dedup(child);
        }
    }

    fn assign_ids(node: &mut Node, next: &mut u32) {
        if node.node_type != NodeType::Root {
            *next += 1;
            node.id = format!("n{next}");
        }
        for child in &mut node.children {
            assign_ids(child, next);
        }
    }

    proptest! {
        #[test]
        fn prop_tree_round_trip(tree in arb_tree()) {
            let json = serde_json::to_vec(&tree).unwrap();
            let back: Node = serde_json::from_slice(&json).unwrap();
            prop_assert!(back.check().is_ok());
            let all = back.all_ns(ROOT_NAME);
            let unique: HashSet<&String> = all.iter().collect();
            prop_assert_eq!(unique.len(), all.len());
            prop_assert_eq!(back, tree);
        }

        #[test]
        fn prop_leaf_ns_resolves_to_leaf(tree in arb_tree()) {
            for leaf in tree.leaves(ROOT_NAME) {
                let found = tree.get_by_ns(&leaf.ns);
                prop_assert!(found.is_some_and(|n| n.is_leaf() && n.id == leaf.id));
            }
        }
    }
}
