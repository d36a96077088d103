//! Nested containers of tensor-like leaves.
//!
//! Operators accept and return pytrees so branches can carry structured
//! state. Flattening splits a tree into its leaf sequence plus a
//! [`TreeStructure`] descriptor; two trees are contract-compatible only when
//! their descriptors compare equal. Dict entries are kept sorted by key so
//! structural equality is insertion-order independent.

use std::collections::BTreeMap;

/// A nested container of leaves.
#[derive(Clone, Debug)]
pub enum PyTree<T> {
    Leaf(T),
    Tuple(Vec<PyTree<T>>),
    Dict(BTreeMap<String, PyTree<T>>),
}

/// Shape of a pytree with the leaves erased.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeStructure {
    Leaf,
    Tuple(Vec<TreeStructure>),
    Dict(Vec<(String, TreeStructure)>),
}

impl<T> PyTree<T> {
    pub fn leaf(value: T) -> Self {
        PyTree::Leaf(value)
    }

    pub fn tuple(items: Vec<PyTree<T>>) -> Self {
        PyTree::Tuple(items)
    }

    /// Borrowed leaves in depth-first order.
    pub fn leaves(&self) -> Vec<&T> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            PyTree::Leaf(v) => out.push(v),
            PyTree::Tuple(items) => items.iter().for_each(|t| t.collect_leaves(out)),
            PyTree::Dict(items) => items.values().for_each(|t| t.collect_leaves(out)),
        }
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            PyTree::Leaf(_) => 1,
            PyTree::Tuple(items) => items.iter().map(|t| t.leaf_count()).sum(),
            PyTree::Dict(items) => items.values().map(|t| t.leaf_count()).sum(),
        }
    }

    pub fn structure(&self) -> TreeStructure {
        match self {
            PyTree::Leaf(_) => TreeStructure::Leaf,
            PyTree::Tuple(items) => {
                TreeStructure::Tuple(items.iter().map(|t| t.structure()).collect())
            }
            PyTree::Dict(items) => TreeStructure::Dict(
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.structure()))
                    .collect(),
            ),
        }
    }

    /// Leaves plus the structure needed to rebuild the tree.
    pub fn flatten(&self) -> (Vec<&T>, TreeStructure) {
        (self.leaves(), self.structure())
    }

    /// Consume the tree into owned leaves and structure.
    pub fn into_flatten(self) -> (Vec<T>, TreeStructure) {
        let structure = self.structure();
        let mut leaves = Vec::new();
        self.collect_into(&mut leaves);
        (leaves, structure)
    }

    fn collect_into(self, out: &mut Vec<T>) {
        match self {
            PyTree::Leaf(v) => out.push(v),
            PyTree::Tuple(items) => items.into_iter().for_each(|t| t.collect_into(out)),
            PyTree::Dict(items) => items.into_values().for_each(|t| t.collect_into(out)),
        }
    }

    /// Rebuild a tree of the given structure from a leaf sequence. The
    /// sequence length must match the structure's leaf count exactly.
    pub fn unflatten<I>(structure: &TreeStructure, leaves: I) -> Option<Self>
    where
        I: IntoIterator<Item = T>,
    {
        let mut iter = leaves.into_iter();
        let tree = Self::unflatten_inner(structure, &mut iter)?;
        match iter.next() {
            Some(_) => None,
            None => Some(tree),
        }
    }

    fn unflatten_inner<I>(structure: &TreeStructure, leaves: &mut I) -> Option<Self>
    where
        I: Iterator<Item = T>,
    {
        match structure {
            TreeStructure::Leaf => leaves.next().map(PyTree::Leaf),
            TreeStructure::Tuple(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Self::unflatten_inner(item, leaves)?);
                }
                Some(PyTree::Tuple(out))
            }
            TreeStructure::Dict(items) => {
                let mut out = BTreeMap::new();
                for (key, item) in items {
                    out.insert(key.clone(), Self::unflatten_inner(item, leaves)?);
                }
                Some(PyTree::Dict(out))
            }
        }
    }

    /// Apply a fallible function to every leaf, preserving structure.
    pub fn try_map<U, E, F>(&self, f: &mut F) -> std::result::Result<PyTree<U>, E>
    where
        F: FnMut(&T) -> std::result::Result<U, E>,
    {
        Ok(match self {
            PyTree::Leaf(v) => PyTree::Leaf(f(v)?),
            PyTree::Tuple(items) => PyTree::Tuple(
                items
                    .iter()
                    .map(|t| t.try_map(f))
                    .collect::<std::result::Result<_, _>>()?,
            ),
            PyTree::Dict(items) => PyTree::Dict(
                items
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.try_map(f)?)))
                    .collect::<std::result::Result<_, _>>()?,
            ),
        })
    }
}

impl TreeStructure {
    pub fn leaf_count(&self) -> usize {
        match self {
            TreeStructure::Leaf => 1,
            TreeStructure::Tuple(items) => items.iter().map(|t| t.leaf_count()).sum(),
            TreeStructure::Dict(items) => items.iter().map(|(_, t)| t.leaf_count()).sum(),
        }
    }

    /// Dotted path of every leaf in depth-first order, used to point error
    /// messages at the offending leaf. A bare leaf has the empty path.
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths(None, &mut out);
        out
    }

    fn collect_paths(&self, prefix: Option<&str>, out: &mut Vec<String>) {
        match self {
            TreeStructure::Leaf => out.push(prefix.unwrap_or("").to_string()),
            TreeStructure::Tuple(items) => {
                for (i, item) in items.iter().enumerate() {
                    let path = match prefix {
                        Some(p) => format!("{p}.{i}"),
                        None => i.to_string(),
                    };
                    item.collect_paths(Some(&path), out);
                }
            }
            TreeStructure::Dict(items) => {
                for (key, item) in items {
                    let path = match prefix {
                        Some(p) => format!("{p}.{key}"),
                        None => key.clone(),
                    };
                    item.collect_paths(Some(&path), out);
                }
            }
        }
    }
}

impl std::fmt::Display for TreeStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeStructure::Leaf => write!(f, "*"),
            TreeStructure::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            TreeStructure::Dict(items) => {
                write!(f, "{{")?;
                for (i, (key, item)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {item}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PyTree<i32> {
        let mut dict = BTreeMap::new();
        dict.insert("a".to_string(), PyTree::leaf(3));
        dict.insert("b".to_string(), PyTree::leaf(4));
        PyTree::tuple(vec![
            PyTree::leaf(1),
            PyTree::tuple(vec![PyTree::leaf(2), PyTree::Dict(dict)]),
        ])
    }

    #[test]
    fn flatten_orders_leaves_depth_first() {
        let tree = sample();
        let (leaves, structure) = tree.flatten();
        assert_eq!(leaves, vec![&1, &2, &3, &4]);
        assert_eq!(structure.leaf_count(), 4);
    }

    #[test]
    fn unflatten_round_trips() {
        let tree = sample();
        let (leaves, structure) = tree.clone().into_flatten();
        let rebuilt = PyTree::unflatten(&structure, leaves).unwrap();
        assert_eq!(rebuilt.structure(), structure);
        assert_eq!(rebuilt.leaves(), tree.leaves());
    }

    #[test]
    fn unflatten_rejects_wrong_leaf_counts() {
        let structure = sample().structure();
        assert!(PyTree::unflatten(&structure, vec![1, 2, 3]).is_none());
        assert!(PyTree::unflatten(&structure, vec![1, 2, 3, 4, 5]).is_none());
    }

    #[test]
    fn structures_distinguish_shapes() {
        let a = PyTree::tuple(vec![PyTree::leaf(1), PyTree::leaf(2)]).structure();
        let b = PyTree::tuple(vec![PyTree::tuple(vec![PyTree::leaf(1), PyTree::leaf(2)])])
            .structure();
        assert_ne!(a, b);
        assert_eq!(format!("{a}"), "(*, *)");
        assert_eq!(format!("{b}"), "((*, *))");
    }

    #[test]
    fn leaf_paths_name_every_leaf() {
        let paths = sample().structure().leaf_paths();
        assert_eq!(paths, vec!["0", "1.0", "1.1.a", "1.1.b"]);
    }

    #[test]
    fn dict_order_is_key_sorted() {
        let mut first = BTreeMap::new();
        first.insert("z".to_string(), PyTree::leaf(1));
        first.insert("a".to_string(), PyTree::leaf(2));
        let (leaves, _) = PyTree::Dict(first).into_flatten();
        assert_eq!(leaves, vec![2, 1]);
    }
}
