//! Tree structure for phylogenetic inference.
//!
//! Represents a rooted binary phylogenetic tree with branch lengths.
//! Nodes are indexed 0..n_nodes, with tips first, then internal nodes.
//!
//! The tree is the topology provider for the likelihood engine: it can be
//! mutated (branch lengths, subtree exchange) and keeps a journal of its
//! edits so a rejected proposal can be undone alongside the engine state.

use std::collections::HashMap;

use crate::error::{LikelihoodError, Result};

/// Stable node identifier: index into the tree's arrays.
pub type NodeId = usize;

/// Classification of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Tip,
    Internal,
    Root,
}

/// Reversible edit recorded since the last `store_state`.
#[derive(Clone, Debug, PartialEq)]
enum TreeEdit {
    BranchLength { node: NodeId, old: f64 },
    Exchange { a: NodeId, b: NodeId },
}

#[derive(Debug, Clone)]
pub struct Tree {
    n_nodes: usize,
    n_tips: usize,
    parent: Vec<Option<NodeId>>,
    branch_lengths: Vec<f64>,
    children: Vec<Vec<NodeId>>,
    root_index: NodeId,
    tip_names: Vec<String>,
    tip_name_to_idx: HashMap<String, NodeId>,
    post_order: Vec<NodeId>,
    random: bool,
    journal: Vec<TreeEdit>,
}

impl Tree {
    /// Build tree from structure arrays.
    ///
    /// # Arguments
    /// * `parent_indices` - Parent index for each node (-1 for root)
    /// * `branch_lengths` - Branch length for each node
    /// * `n_tips` - Number of tip nodes
    pub fn from_structure(
        parent_indices: Vec<i32>,
        branch_lengths: Vec<f64>,
        n_tips: usize,
    ) -> Result<Self> {
        let names = (0..n_tips).map(|i| format!("t{}", i)).collect();
        Self::from_structure_named(parent_indices, branch_lengths, names)
    }

    /// Same as [`Tree::from_structure`] with explicit tip names; the tip
    /// count is the number of names.
    pub fn from_structure_named(
        parent_indices: Vec<i32>,
        branch_lengths: Vec<f64>,
        tip_names: Vec<String>,
    ) -> Result<Self> {
        let n_nodes = parent_indices.len();
        let n_tips = tip_names.len();

        if branch_lengths.len() != n_nodes {
            return Err(LikelihoodError::InvalidTree(
                "parent_indices and branch_lengths must have same length".to_string(),
            ));
        }
        if n_tips < 2 || n_tips >= n_nodes {
            return Err(LikelihoodError::InvalidTree(format!(
                "{} tips in a tree of {} nodes",
                n_tips, n_nodes
            )));
        }

        let mut parent = vec![None; n_nodes];
        let mut children = vec![Vec::new(); n_nodes];
        let mut root_index = None;
        for (child_idx, &parent_idx) in parent_indices.iter().enumerate() {
            if parent_idx < 0 {
                if root_index.replace(child_idx).is_some() {
                    return Err(LikelihoodError::InvalidTree("more than one root".to_string()));
                }
                continue;
            }
            let p = parent_idx as usize;
            if p >= n_nodes || p == child_idx {
                return Err(LikelihoodError::InvalidTree(format!(
                    "node {} has invalid parent {}",
                    child_idx, parent_idx
                )));
            }
            parent[child_idx] = Some(p);
            children[p].push(child_idx);
        }

        // Find root (node with no parent)
        let root_index = root_index.ok_or_else(|| {
            LikelihoodError::InvalidTree(
                "No root node found (no node with parent_idx == -1)".to_string(),
            )
        })?;

        for (node, kids) in children.iter().enumerate() {
            let expected = if node < n_tips { 0 } else { 2 };
            if kids.len() != expected {
                return Err(LikelihoodError::InvalidTree(format!(
                    "node {} has {} children, expected {}",
                    node,
                    kids.len(),
                    expected
                )));
            }
        }
        if let Some(bad) = branch_lengths.iter().position(|b| !b.is_finite() || *b < 0.0) {
            return Err(LikelihoodError::InvalidTree(format!(
                "node {} has branch length {}",
                bad, branch_lengths[bad]
            )));
        }

        let tip_name_to_idx = tip_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect::<HashMap<_, _>>();
        if tip_name_to_idx.len() != n_tips {
            return Err(LikelihoodError::InvalidTree("duplicate tip names".to_string()));
        }

        let mut tree = Tree {
            n_nodes,
            n_tips,
            parent,
            branch_lengths,
            children,
            root_index,
            tip_names,
            tip_name_to_idx,
            post_order: Vec::with_capacity(n_nodes),
            random: true,
            journal: Vec::new(),
        };
        tree.rebuild_post_order();

        // A cycle leaves nodes unreachable from the root.
        if tree.post_order.len() != n_nodes {
            return Err(LikelihoodError::InvalidTree(format!(
                "only {} of {} nodes reachable from root",
                tree.post_order.len(),
                n_nodes
            )));
        }

        Ok(tree)
    }

    /// Parse a rooted binary Newick string.
    ///
    /// Tip `i` of the resulting tree is `taxon_names[i]`; internal nodes are
    /// numbered after the tips in post-order, so the root is the last node.
    pub fn from_newick(newick: &str, taxon_names: &[String]) -> Result<Self> {
        let mut parser = NewickParser {
            bytes: newick.as_bytes(),
            pos: 0,
        };
        let parsed = parser.parse_tree()?;

        let n_tips = taxon_names.len();
        if n_tips < 2 {
            return Err(LikelihoodError::InvalidTree(
                "a rooted tree needs at least two taxa".to_string(),
            ));
        }
        let name_to_idx: HashMap<&str, usize> = taxon_names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        let n_nodes = 2 * n_tips - 1;
        let mut numbering = NewickNumbering {
            name_to_idx,
            parent_indices: vec![-1i32; n_nodes],
            branch_lengths: vec![0.0; n_nodes],
            child_order: Vec::with_capacity(n_tips - 1),
            seen: vec![false; n_tips],
            next_internal: n_tips,
        };
        let root = numbering.assign(&parsed)?;
        if let Some(missing) = numbering.seen.iter().position(|s| !s) {
            return Err(LikelihoodError::MissingTaxon {
                taxon: taxon_names[missing].clone(),
            });
        }
        numbering.branch_lengths[root] = 0.0;

        let mut tree = Self::from_structure_named(
            numbering.parent_indices,
            numbering.branch_lengths,
            taxon_names.to_vec(),
        )?;
        // Keep left/right as written in the Newick string
        for (node, pair) in numbering.child_order {
            tree.children[node] = pair.to_vec();
        }
        tree.rebuild_post_order();
        Ok(tree)
    }

    /// Mark the tree as fixed (or random). Change events coming from a
    /// fixed tree are rejected by the engine.
    pub fn with_random(mut self, random: bool) -> Self {
        self.random = random;
        self
    }

    pub fn is_random(&self) -> bool {
        self.random
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.n_nodes
    }

    #[inline]
    pub fn tip_count(&self) -> usize {
        self.n_tips
    }

    #[inline]
    pub fn internal_count(&self) -> usize {
        self.n_nodes - self.n_tips
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root_index
    }

    #[inline]
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.parent[node]
    }

    /// Left child first. Trees parsed from Newick keep the written order;
    /// `from_structure` trees list children by ascending node index.
    #[inline]
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.children[node]
    }

    #[inline]
    pub fn is_tip(&self, node: NodeId) -> bool {
        node < self.n_tips
    }

    pub fn kind(&self, node: NodeId) -> NodeKind {
        if node == self.root_index {
            NodeKind::Root
        } else if self.is_tip(node) {
            NodeKind::Tip
        } else {
            NodeKind::Internal
        }
    }

    #[inline]
    pub fn branch_length(&self, node: NodeId) -> f64 {
        self.branch_lengths[node]
    }

    pub fn contains(&self, node: NodeId) -> bool {
        node < self.n_nodes
    }

    pub fn tip_name(&self, tip: NodeId) -> Option<&str> {
        self.tip_names.get(tip).map(String::as_str)
    }

    pub fn tip_names(&self) -> &[String] {
        &self.tip_names
    }

    pub fn tip_index(&self, name: &str) -> Option<NodeId> {
        self.tip_name_to_idx.get(name).copied()
    }

    /// Get post-order traversal of nodes (tips to root).
    pub fn post_order(&self) -> &[NodeId] {
        &self.post_order
    }

    /// True if `ancestor` lies on the path from `node` to the root
    /// (a node is its own ancestor).
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.parent[n];
        }
        false
    }

    fn rebuild_post_order(&mut self) {
        let mut order = Vec::with_capacity(self.n_nodes);
        let mut stack = vec![(self.root_index, false)];
        let mut visited = vec![false; self.n_nodes];

        // Visit children first
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if std::mem::replace(&mut visited[node], true) {
                continue;
            }
            stack.push((node, true));
            for &child in self.children[node].iter().rev() {
                stack.push((child, false));
            }
        }

        self.post_order = order;
    }

    fn check_node(&self, node: NodeId) -> Result<()> {
        if self.contains(node) {
            Ok(())
        } else {
            Err(LikelihoodError::UnknownNode {
                node,
                node_count: self.n_nodes,
            })
        }
    }

    /// Set the length of the branch above `node`.
    pub fn set_branch_length(&mut self, node: NodeId, length: f64) -> Result<()> {
        self.check_node(node)?;
        if node == self.root_index {
            return Err(LikelihoodError::ContractViolation(
                "the root has no branch".to_string(),
            ));
        }
        if !length.is_finite() || length < 0.0 {
            return Err(LikelihoodError::ContractViolation(format!(
                "branch length {} is not a finite non-negative number",
                length
            )));
        }
        let old = std::mem::replace(&mut self.branch_lengths[node], length);
        self.journal.push(TreeEdit::BranchLength { node, old });
        Ok(())
    }

    /// Exchange the subtrees rooted at `a` and `b`: each takes the other's
    /// place (and branch) under the other's parent.
    ///
    /// Returns the two former parents, whose combinations changed.
    pub fn exchange(&mut self, a: NodeId, b: NodeId) -> Result<(NodeId, NodeId)> {
        self.check_node(a)?;
        self.check_node(b)?;
        let (pa, pb) = match (self.parent[a], self.parent[b]) {
            (Some(pa), Some(pb)) => (pa, pb),
            _ => {
                return Err(LikelihoodError::ContractViolation(
                    "cannot exchange the root".to_string(),
                ))
            }
        };
        if pa == pb {
            return Err(LikelihoodError::ContractViolation(format!(
                "nodes {} and {} are siblings",
                a, b
            )));
        }
        if self.is_ancestor(a, b) || self.is_ancestor(b, a) {
            return Err(LikelihoodError::ContractViolation(format!(
                "nodes {} and {} are on the same lineage",
                a, b
            )));
        }
        self.swap_subtrees(a, b, pa, pb);
        self.journal.push(TreeEdit::Exchange { a, b });
        Ok((pa, pb))
    }

    fn swap_subtrees(&mut self, a: NodeId, b: NodeId, pa: NodeId, pb: NodeId) {
        for slot in self.children[pa].iter_mut() {
            if *slot == a {
                *slot = b;
            }
        }
        for slot in self.children[pb].iter_mut() {
            if *slot == b {
                *slot = a;
            }
        }
        self.parent[a] = Some(pb);
        self.parent[b] = Some(pa);
        self.branch_lengths.swap(a, b);
        self.rebuild_post_order();
    }

    /// Number of edits made since the last `store_state`.
    pub fn pending_edits(&self) -> usize {
        self.journal.len()
    }

    /// Accept all edits made since the last call.
    pub fn store_state(&mut self) {
        self.journal.clear();
    }

    /// Undo all edits made since the last `store_state`, newest first.
    pub fn restore_state(&mut self) {
        while let Some(edit) = self.journal.pop() {
            match edit {
                TreeEdit::BranchLength { node, old } => {
                    self.branch_lengths[node] = old;
                }
                TreeEdit::Exchange { a, b } => {
                    if let (Some(pa), Some(pb)) = (self.parent[a], self.parent[b]) {
                        self.swap_subtrees(a, b, pa, pb);
                    }
                }
            }
        }
    }
}

/// Numbers parsed Newick nodes: tips by taxon index, internal nodes after
/// the tips in post-order.
struct NewickNumbering<'a> {
    name_to_idx: HashMap<&'a str, usize>,
    parent_indices: Vec<i32>,
    branch_lengths: Vec<f64>,
    child_order: Vec<(NodeId, [NodeId; 2])>,
    seen: Vec<bool>,
    next_internal: usize,
}

impl NewickNumbering<'_> {
    fn assign(&mut self, node: &ParsedNode) -> Result<NodeId> {
        match node {
            ParsedNode::Tip { name, length } => {
                let idx = *self
                    .name_to_idx
                    .get(name.as_str())
                    .ok_or_else(|| LikelihoodError::MissingTaxon { taxon: name.clone() })?;
                if std::mem::replace(&mut self.seen[idx], true) {
                    return Err(LikelihoodError::InvalidTree(format!(
                        "taxon '{}' appears twice",
                        name
                    )));
                }
                self.branch_lengths[idx] = *length;
                Ok(idx)
            }
            ParsedNode::Internal { left, right, length } => {
                let l = self.assign(left)?;
                let r = self.assign(right)?;
                let idx = self.next_internal;
                if idx >= self.parent_indices.len() {
                    return Err(LikelihoodError::InvalidTree(
                        "more tips in newick than taxa".to_string(),
                    ));
                }
                self.next_internal += 1;
                self.parent_indices[l] = idx as i32;
                self.parent_indices[r] = idx as i32;
                self.branch_lengths[idx] = *length;
                self.child_order.push((idx, [l, r]));
                Ok(idx)
            }
        }
    }
}

#[derive(Debug)]
enum ParsedNode {
    Tip {
        name: String,
        length: f64,
    },
    Internal {
        left: Box<ParsedNode>,
        right: Box<ParsedNode>,
        length: f64,
    },
}

struct NewickParser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> NewickParser<'a> {
    fn parse_tree(&mut self) -> Result<ParsedNode> {
        let node = self.parse_node()?;
        self.skip_ws();
        if self.peek() == Some(b';') {
            self.pos += 1;
        }
        self.skip_ws();
        if self.pos != self.bytes.len() {
            return Err(self.error("trailing characters"));
        }
        Ok(node)
    }

    fn parse_node(&mut self) -> Result<ParsedNode> {
        self.skip_ws();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            let left = self.parse_node()?;
            self.expect(b',')?;
            let right = self.parse_node()?;
            self.skip_ws();
            if self.peek() == Some(b',') {
                return Err(self.error("only binary trees are supported"));
            }
            self.expect(b')')?;
            // Internal node labels are read and dropped.
            self.parse_label();
            let length = self.parse_length()?;
            Ok(ParsedNode::Internal {
                left: Box::new(left),
                right: Box::new(right),
                length,
            })
        } else {
            let name = self.parse_label();
            if name.is_empty() {
                return Err(self.error("expected a taxon label"));
            }
            let length = self.parse_length()?;
            Ok(ParsedNode::Tip { name, length })
        }
    }

    fn parse_label(&mut self) -> String {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b'(' | b')' | b',' | b':' | b';') || c.is_ascii_whitespace() {
                break;
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.bytes[start..self.pos])
            .trim_matches('\'')
            .to_string()
    }

    fn parse_length(&mut self) -> Result<f64> {
        self.skip_ws();
        if self.peek() != Some(b':') {
            return Ok(0.0);
        }
        self.pos += 1;
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, b'.' | b'-' | b'+' | b'e' | b'E') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("");
        text.parse::<f64>()
            .map_err(|_| self.error(&format!("bad branch length '{}'", text)))
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", c as char)))
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().map_or(false, |c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn error(&self, msg: &str) -> LikelihoodError {
        LikelihoodError::InvalidTree(format!("newick position {}: {}", self.pos, msg))
    }
}
