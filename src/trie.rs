//! The prefix trie underneath the prefix cache.
//!
//! A bitwise patricia trie keyed by address prefix. Nodes live in an arena
//! and refer to each other through indexes, so the structure contains no
//! cycles and nodes can carry an optional payload. Nodes are never removed;
//! releasing a payload leaves the node in place as a branch point, which is
//! exactly what the prefix cache needs when a prefix loses its last ROA.
//!
//! IPv4 and IPv6 prefixes live under separate roots. Address bits are kept
//! left-aligned in a `u128` with anything beyond the prefix length zeroed.

use crate::payload::AddressPrefix;


//------------ NodeIx --------------------------------------------------------

/// The index of a node within the trie arena.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NodeIx(u32);

impl NodeIx {
    fn index(self) -> usize {
        self.0 as usize
    }
}


//------------ PrefixTree ----------------------------------------------------

/// A patricia trie with per-node payloads.
#[derive(Debug)]
pub struct PrefixTree<T> {
    nodes: Vec<Node<T>>,
    root_v4: Option<NodeIx>,
    root_v6: Option<NodeIx>,
}

#[derive(Debug)]
struct Node<T> {
    prefix: AddressPrefix,
    parent: Option<NodeIx>,
    children: [Option<NodeIx>; 2],
    payload: Option<T>,
}

impl<T> PrefixTree<T> {
    /// Creates an empty trie.
    pub fn new() -> Self {
        PrefixTree {
            nodes: Vec::new(),
            root_v4: None,
            root_v6: None,
        }
    }

    /// Returns the number of nodes in the trie, glue nodes included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the prefix a node is keyed by.
    pub fn prefix(&self, node: NodeIx) -> AddressPrefix {
        self.nodes[node.index()].prefix
    }

    /// Returns a reference to the payload of a node if it carries one.
    pub fn payload(&self, node: NodeIx) -> Option<&T> {
        self.nodes[node.index()].payload.as_ref()
    }

    /// Returns a mutable reference to the payload of a node.
    pub fn payload_mut(&mut self, node: NodeIx) -> Option<&mut T> {
        self.nodes[node.index()].payload.as_mut()
    }

    /// Attaches a payload to a node, returning any previous payload.
    pub fn set_payload(&mut self, node: NodeIx, payload: T) -> Option<T> {
        self.nodes[node.index()].payload.replace(payload)
    }

    /// Removes the payload from a node. The node itself stays.
    pub fn clear_payload(&mut self, node: NodeIx) -> Option<T> {
        self.nodes[node.index()].payload.take()
    }

    /// Returns the node for the given prefix, inserting it if necessary.
    ///
    /// A freshly inserted node carries no payload. The insert may create an
    /// additional glue node at a branch point.
    pub fn insert_or_get(&mut self, prefix: AddressPrefix) -> NodeIx {
        let root = if prefix.is_v4() { self.root_v4 } else { self.root_v6 };
        let root = match root {
            Some(root) => root,
            None => {
                let node = self.new_node(prefix, None);
                if prefix.is_v4() {
                    self.root_v4 = Some(node)
                }
                else {
                    self.root_v6 = Some(node)
                }
                return node
            }
        };

        // Walk down as far as the key reaches.
        let mut cur = root;
        loop {
            let node = &self.nodes[cur.index()];
            let node_len = node.prefix.address_length();
            if node_len >= prefix.address_length() {
                break
            }
            match node.children[branch_bit(prefix, node_len)] {
                Some(child) => cur = child,
                None => break,
            }
        }

        // Find the first bit where the key and the found node disagree.
        let differ = first_differ(prefix, self.nodes[cur.index()].prefix);

        // Climb back up to the highest node still below the differing bit.
        while let Some(parent) = self.nodes[cur.index()].parent {
            if self.nodes[parent.index()].prefix.address_length() >= differ {
                cur = parent;
            }
            else {
                break
            }
        }

        let cur_len = self.nodes[cur.index()].prefix.address_length();
        if differ == prefix.address_length() && cur_len == differ {
            // Exact node, possibly a former glue node.
            return cur
        }

        if cur_len == differ {
            // The found node is a proper prefix of the key. Attach below.
            let node = self.new_node(prefix, Some(cur));
            let bit = branch_bit(prefix, cur_len);
            self.nodes[cur.index()].children[bit] = Some(node);
            return node
        }

        if prefix.address_length() == differ {
            // The key is a proper prefix of the found node. Splice in above.
            let node = self.new_node(prefix, self.nodes[cur.index()].parent);
            let bit = branch_bit(
                self.nodes[cur.index()].prefix, prefix.address_length()
            );
            self.nodes[node.index()].children[bit] = Some(cur);
            self.relink_parent(cur, node);
            self.nodes[cur.index()].parent = Some(node);
            return node
        }

        // The key and the found node branch apart at `differ`. Create a
        // glue node holding both.
        let glue_prefix = AddressPrefix::new(prefix.address(), differ);
        let glue = self.new_node(glue_prefix, self.nodes[cur.index()].parent);
        let node = self.new_node(prefix, Some(glue));
        let bit = branch_bit(prefix, differ);
        self.nodes[glue.index()].children[bit] = Some(node);
        self.nodes[glue.index()].children[1 - bit] = Some(cur);
        self.relink_parent(cur, glue);
        self.nodes[cur.index()].parent = Some(glue);
        node
    }

    /// Returns the node keyed by the given prefix if it exists.
    pub fn get(&self, prefix: AddressPrefix) -> Option<NodeIx> {
        let mut cur = if prefix.is_v4() { self.root_v4 } else { self.root_v6 }?;
        loop {
            let node = &self.nodes[cur.index()];
            if node.prefix == prefix {
                return Some(cur)
            }
            let node_len = node.prefix.address_length();
            if node_len >= prefix.address_length()
                || !node.prefix.covers(prefix)
            {
                return None
            }
            cur = node.children[branch_bit(prefix, node_len)]?;
        }
    }

    /// Walks upward to the closest ancestor that carries a payload.
    pub fn parent_with_payload(&self, node: NodeIx) -> Option<NodeIx> {
        let mut cur = self.nodes[node.index()].parent?;
        loop {
            if self.nodes[cur.index()].payload.is_some() {
                return Some(cur)
            }
            cur = self.nodes[cur.index()].parent?;
        }
    }

    /// Collects the closest descendants that carry a payload.
    ///
    /// Descendants hidden behind another payload carrier are not reported;
    /// the carrier itself is.
    pub fn children_with_payload(&self, node: NodeIx) -> Vec<NodeIx> {
        let mut found = Vec::new();
        for child in self.nodes[node.index()].children.iter().flatten() {
            self.collect_carriers(*child, &mut found);
        }
        found
    }

    fn collect_carriers(&self, node: NodeIx, found: &mut Vec<NodeIx>) {
        if self.nodes[node.index()].payload.is_some() {
            found.push(node);
            return
        }
        for child in self.nodes[node.index()].children.iter().flatten() {
            self.collect_carriers(*child, found);
        }
    }

    /// Returns every node that carries a payload, in arena order.
    pub fn carriers(&self) -> Vec<NodeIx> {
        self.nodes.iter().enumerate()
            .filter(|(_, node)| node.payload.is_some())
            .map(|(idx, _)| NodeIx(idx as u32))
            .collect()
    }

    fn new_node(
        &mut self, prefix: AddressPrefix, parent: Option<NodeIx>
    ) -> NodeIx {
        let ix = NodeIx(self.nodes.len() as u32);
        self.nodes.push(Node {
            prefix,
            parent,
            children: [None, None],
            payload: None,
        });
        ix
    }

    /// Makes `new` take over the parent slot previously held by `old`.
    fn relink_parent(&mut self, old: NodeIx, new: NodeIx) {
        match self.nodes[old.index()].parent {
            Some(parent) => {
                let parent = &mut self.nodes[parent.index()];
                for slot in parent.children.iter_mut() {
                    if *slot == Some(old) {
                        *slot = Some(new);
                    }
                }
            }
            None => {
                if self.nodes[old.index()].prefix.is_v4() {
                    self.root_v4 = Some(new)
                }
                else {
                    self.root_v6 = Some(new)
                }
            }
        }
    }
}

impl<T> Default for PrefixTree<T> {
    fn default() -> Self {
        Self::new()
    }
}


//------------ Helpers -------------------------------------------------------

/// Returns the child slot the prefix takes below a node of length `len`.
fn branch_bit(prefix: AddressPrefix, len: u8) -> usize {
    if len >= 128 {
        return 0
    }
    ((prefix.bits() >> (127 - len)) & 1) as usize
}

/// Returns the position of the first differing bit of two prefixes.
///
/// Comparison stops at the shorter length; if the prefixes agree until
/// there, that length is returned.
fn first_differ(left: AddressPrefix, right: AddressPrefix) -> u8 {
    let upto = left.address_length().min(right.address_length());
    if upto == 0 {
        return 0
    }
    let diff = left.bits() ^ right.bits();
    let diff = diff & (u128::MAX << (128 - upto));
    if diff == 0 {
        upto
    }
    else {
        (diff.leading_zeros() as u8).min(upto)
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn prefix(s: &str) -> AddressPrefix {
        AddressPrefix::from_str(s).unwrap()
    }

    #[test]
    fn insert_and_get() {
        let mut tree = PrefixTree::<u32>::new();
        let a = tree.insert_or_get(prefix("10.0.0.0/16"));
        let b = tree.insert_or_get(prefix("10.0.1.0/24"));
        let c = tree.insert_or_get(prefix("10.0.0.0/16"));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(tree.get(prefix("10.0.0.0/16")), Some(a));
        assert_eq!(tree.get(prefix("10.0.1.0/24")), Some(b));
        assert_eq!(tree.get(prefix("10.0.2.0/24")), None);
        assert_eq!(tree.prefix(b), prefix("10.0.1.0/24"));
    }

    #[test]
    fn glue_node_becomes_real() {
        let mut tree = PrefixTree::<u32>::new();
        // These two force a glue node at 10.0.0.0/23.
        tree.insert_or_get(prefix("10.0.0.0/24"));
        tree.insert_or_get(prefix("10.0.1.0/24"));
        let glue = tree.get(prefix("10.0.0.0/23")).unwrap();
        assert!(tree.payload(glue).is_none());
        // Inserting the glue prefix reuses the glue node.
        assert_eq!(tree.insert_or_get(prefix("10.0.0.0/23")), glue);
    }

    #[test]
    fn splice_above() {
        let mut tree = PrefixTree::<u32>::new();
        let more = tree.insert_or_get(prefix("10.0.1.0/24"));
        let less = tree.insert_or_get(prefix("10.0.0.0/16"));
        assert_eq!(tree.get(prefix("10.0.0.0/16")), Some(less));
        assert_eq!(tree.parent_with_payload(more), None);
        tree.set_payload(less, 1);
        assert_eq!(tree.parent_with_payload(more), Some(less));
    }

    #[test]
    fn parent_walk_skips_empty_nodes() {
        let mut tree = PrefixTree::<u32>::new();
        let top = tree.insert_or_get(prefix("10.0.0.0/8"));
        let mid = tree.insert_or_get(prefix("10.0.0.0/16"));
        let leaf = tree.insert_or_get(prefix("10.0.0.0/24"));
        tree.set_payload(top, 8);
        assert_eq!(tree.parent_with_payload(leaf), Some(top));
        tree.set_payload(mid, 16);
        assert_eq!(tree.parent_with_payload(leaf), Some(mid));
        tree.clear_payload(mid);
        assert_eq!(tree.parent_with_payload(leaf), Some(top));
    }

    #[test]
    fn children_stop_at_carriers() {
        let mut tree = PrefixTree::<u32>::new();
        let top = tree.insert_or_get(prefix("10.0.0.0/8"));
        let mid = tree.insert_or_get(prefix("10.0.0.0/16"));
        let below = tree.insert_or_get(prefix("10.0.0.0/24"));
        let other = tree.insert_or_get(prefix("10.1.0.0/16"));
        tree.set_payload(mid, 16);
        tree.set_payload(below, 24);
        tree.set_payload(other, 17);

        let mut children = tree.children_with_payload(top);
        children.sort_by_key(|ix| tree.prefix(*ix).to_string());
        let prefixes: Vec<_> = children.iter()
            .map(|ix| tree.prefix(*ix).to_string())
            .collect();
        // The /24 hides behind the /16 carrier.
        assert_eq!(prefixes, ["10.0.0.0/16", "10.1.0.0/16"]);
    }

    #[test]
    fn families_are_separate() {
        let mut tree = PrefixTree::<u32>::new();
        let v4 = tree.insert_or_get(prefix("10.0.0.0/8"));
        let v6 = tree.insert_or_get(prefix("2001:db8::/32"));
        assert_ne!(v4, v6);
        assert_eq!(tree.get(prefix("10.0.0.0/8")), Some(v4));
        assert_eq!(tree.get(prefix("2001:db8::/32")), Some(v6));
        assert_eq!(tree.parent_with_payload(v6), None);
    }

    #[test]
    fn default_route_is_a_valid_key() {
        let mut tree = PrefixTree::<u32>::new();
        let dflt = tree.insert_or_get(prefix("0.0.0.0/0"));
        let leaf = tree.insert_or_get(prefix("192.0.2.0/24"));
        tree.set_payload(dflt, 0);
        assert_eq!(tree.parent_with_payload(leaf), Some(dflt));
    }
}
