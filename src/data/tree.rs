//! The multidimensional data tree.
//!
//! Scalars, arrays, and nested arrays of one data type are represented
//! uniformly as a tree of nodes addressed by (index, degree) paths, so the
//! same readiness and propagation code handles arbitrary nesting depth.
//!
//! Node states:
//! - **blank**: neither degree nor data set; a placeholder reserved while a
//!   path is being extended. Never ready.
//! - **branch**: degree fixed, child slots dense in `[0, degree)`.
//! - **leaf**: references exactly one data object; write-once.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::data::object::{DataObject, DataType, Resource};
use crate::data::path::{DataPath, PathSegment};
use crate::error::{DataError, SaveError};
use crate::guard::save_with_retries;
use crate::ids::{DataNodeId, DataObjectId};
use crate::store::{Entity, EntityOps};

/// One node of a data tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataNode {
    pub id: DataNodeId,
    pub parent: Option<DataNodeId>,
    /// Position among siblings; 0 for roots.
    pub index: u32,
    /// Number of expected children; `None` until fixed (blank or leaf).
    pub degree: Option<u32>,
    pub data_type: DataType,
    /// Dense child slots, sized by `degree` once fixed.
    pub children: Vec<Option<DataNodeId>>,
    /// Leaves only: the referenced data object.
    pub data: Option<DataObjectId>,
}

impl DataNode {
    pub fn blank_root(data_type: DataType) -> Self {
        Self {
            id: DataNodeId::new(),
            parent: None,
            index: 0,
            degree: None,
            data_type,
            children: Vec::new(),
            data: None,
        }
    }

    fn blank_child(parent: DataNodeId, index: u32, data_type: DataType) -> Self {
        Self {
            id: DataNodeId::new(),
            parent: Some(parent),
            index,
            degree: None,
            data_type,
            children: Vec::new(),
            data: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_branch(&self) -> bool {
        self.degree.is_some()
    }

    pub fn is_blank(&self) -> bool {
        self.degree.is_none() && self.data.is_none()
    }
}

impl Entity for DataNode {
    type Id = DataNodeId;
    const KIND: &'static str = "data node";

    fn id(&self) -> DataNodeId {
        self.id
    }
}

/// A node designated ready by `get_ready_data_nodes`, with its full path
/// from the tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyNode {
    pub path: DataPath,
    pub node: DataNodeId,
}

/// Store surface the tree operations need.
pub trait TreeStore:
    EntityOps<DataNode> + EntityOps<DataObject> + EntityOps<Resource>
{
}

impl<S> TreeStore for S where
    S: EntityOps<DataNode> + EntityOps<DataObject> + EntityOps<Resource>
{
}

/// Create and store a blank tree root.
pub async fn create_root<S: TreeStore>(
    store: &S,
    data_type: DataType,
) -> Result<DataNode, SaveError> {
    let root = DataNode::blank_root(data_type);
    EntityOps::<DataNode>::insert(store, root.clone()).await?;
    Ok(root)
}

async fn read_node<S: TreeStore>(store: &S, id: DataNodeId) -> Result<DataNode, SaveError> {
    Ok(EntityOps::<DataNode>::get(store, id).await?.record)
}

/// Fix a blank node's degree, or verify an existing one.
async fn fix_degree<S: TreeStore>(
    store: &S,
    retries: u32,
    node: &DataNode,
    declared: u32,
) -> Result<DataNode, SaveError> {
    if let Some(existing) = node.degree {
        if existing != declared {
            return Err(DataError::DegreeMismatch {
                node: node.id,
                expected: existing,
                declared,
            }
            .into());
        }
        return Ok(node.clone());
    }
    save_with_retries(store, node.id, retries, |node: &mut DataNode| {
        match node.degree {
            None => {
                if node.data.is_some() {
                    return Err(SaveError::Rejected(format!(
                        "node {} already holds data, cannot become a branch",
                        node.id
                    )));
                }
                node.degree = Some(declared);
                node.children = vec![None; declared as usize];
                Ok(())
            }
            Some(existing) if existing == declared => Ok(()),
            Some(existing) => Err(DataError::DegreeMismatch {
                node: node.id,
                expected: existing,
                declared,
            }
            .into()),
        }
    })
    .await
}

/// Claim the child slot at `index`, creating a blank child if the slot is
/// empty. A racing claimer may win; the committed slot decides.
async fn get_or_create_child<S: TreeStore>(
    store: &S,
    retries: u32,
    parent: &DataNode,
    index: u32,
) -> Result<DataNodeId, SaveError> {
    let degree = parent.degree.ok_or(DataError::UnknownDegree { node: parent.id })?;
    if index >= degree {
        return Err(DataError::IndexOutOfRange { index, degree }.into());
    }
    if let Some(existing) = parent.children[index as usize] {
        return Ok(existing);
    }

    let candidate = DataNode::blank_child(parent.id, index, parent.data_type);
    let candidate_id = candidate.id;
    EntityOps::<DataNode>::insert(store, candidate).await?;

    let committed = save_with_retries(store, parent.id, retries, |parent: &mut DataNode| {
        let slot = parent
            .children
            .get_mut(index as usize)
            .ok_or(DataError::IndexOutOfRange { index, degree })?;
        if slot.is_none() {
            *slot = Some(candidate_id);
        }
        Ok(())
    })
    .await?;

    // The winner of the race owns the slot; a losing candidate stays
    // orphaned and unreferenced.
    let winner = committed.children[index as usize].expect("slot claimed above");
    if winner != candidate_id {
        trace!(%winner, lost = %candidate_id, "child slot claimed concurrently");
    }
    Ok(winner)
}

/// Walk `path` from `root`, creating blank branches as needed, and return
/// the terminal node's id.
pub async fn get_or_create_node<S: TreeStore>(
    store: &S,
    retries: u32,
    root: DataNodeId,
    path: &DataPath,
) -> Result<DataNodeId, SaveError> {
    let mut current = read_node(store, root).await?;
    for segment in path.segments() {
        if current.is_leaf() {
            return Err(DataError::DataAlreadyExists { path: path.clone() }.into());
        }
        let fixed = fix_degree(store, retries, &current, segment.degree).await?;
        let child = get_or_create_child(store, retries, &fixed, segment.index).await?;
        current = read_node(store, child).await?;
    }
    Ok(current.id)
}

/// Walk/create nodes along `path` and set the data reference on the
/// terminal leaf. Leaves are write-once.
pub async fn add_data_object<S: TreeStore>(
    store: &S,
    retries: u32,
    root: DataNodeId,
    path: &DataPath,
    object: DataObjectId,
) -> Result<DataNodeId, SaveError> {
    let node = get_or_create_node(store, retries, root, path).await?;
    save_with_retries(store, node, retries, |node: &mut DataNode| {
        if node.data.is_some() {
            return Err(DataError::DataAlreadyExists { path: path.clone() }.into());
        }
        if node.degree.is_some() {
            return Err(SaveError::Rejected(format!(
                "node {} is a branch, cannot hold data",
                node.id
            )));
        }
        node.data = Some(object);
        Ok(())
    })
    .await?;
    Ok(node)
}

/// Strict descent: every intermediate node must already exist with a fixed,
/// matching degree.
pub async fn get_node<S: TreeStore>(
    store: &S,
    root: DataNodeId,
    path: &DataPath,
) -> Result<DataNode, SaveError> {
    let mut current = read_node(store, root).await?;
    let mut walked = DataPath::root();
    for segment in path.segments() {
        walked.push(*segment);
        let degree = match current.degree {
            Some(degree) => degree,
            None if current.is_leaf() => {
                return Err(DataError::MissingBranch { path: walked }.into())
            }
            None => return Err(DataError::UnknownDegree { node: current.id }.into()),
        };
        if degree != segment.degree {
            return Err(DataError::DegreeMismatch {
                node: current.id,
                expected: degree,
                declared: segment.degree,
            }
            .into());
        }
        if segment.index >= degree {
            return Err(DataError::IndexOutOfRange {
                index: segment.index,
                degree,
            }
            .into());
        }
        let child = current.children[segment.index as usize]
            .ok_or(DataError::MissingBranch { path: walked.clone() })?;
        current = read_node(store, child).await?;
    }
    Ok(current)
}

/// The data object referenced at `path`, which must name a filled leaf.
pub async fn get_data_object<S: TreeStore>(
    store: &S,
    root: DataNodeId,
    path: &DataPath,
) -> Result<DataObject, SaveError> {
    let node = get_node(store, root, path).await?;
    let object = node
        .data
        .ok_or_else(|| SaveError::Rejected(format!("no data object at {path}")))?;
    Ok(EntityOps::<DataObject>::get(store, object).await?.record)
}

/// Whether the subtree under `node` is fully ready: every expected child
/// exists and is ready, every leaf's object is ready. Order-independent
/// and monotone; blank nodes are never ready.
pub async fn is_ready<S: TreeStore>(store: &S, node: DataNodeId) -> Result<bool, SaveError> {
    let mut stack = vec![node];
    while let Some(id) = stack.pop() {
        let node = read_node(store, id).await?;
        if let Some(object_id) = node.data {
            let object = EntityOps::<DataObject>::get(store, object_id).await?.record;
            if let Some(resource_id) = object.resource() {
                let resource = EntityOps::<Resource>::get(store, resource_id).await?.record;
                if !resource.is_ready() {
                    return Ok(false);
                }
            }
            continue;
        }
        if node.degree.is_none() {
            // Blank placeholder.
            return Ok(false);
        }
        for slot in &node.children {
            match slot {
                Some(child) => stack.push(*child),
                None => return Ok(false),
            }
        }
    }
    Ok(true)
}

/// Leaf paths beneath `node`, relative to it, in index order. Only
/// materialized leaves are enumerated; blank placeholders and unfilled
/// slots contribute nothing.
pub async fn leaf_paths<S: TreeStore>(
    store: &S,
    node: DataNodeId,
) -> Result<Vec<(DataPath, DataNodeId)>, SaveError> {
    let mut leaves = Vec::new();
    let mut stack = vec![(DataPath::root(), node)];
    while let Some((path, id)) = stack.pop() {
        let node = read_node(store, id).await?;
        if node.is_leaf() {
            leaves.push((path, id));
            continue;
        }
        let Some(degree) = node.degree else { continue };
        // Reverse so the stack pops children in index order.
        for index in (0..degree).rev() {
            if let Some(child) = node.children[index as usize] {
                stack.push((path.child(PathSegment::new(index, degree)), child));
            }
        }
    }
    // Depth-first with ordered pushes yields leaves in index order already;
    // sorting keeps the contract explicit under concurrent extension.
    leaves.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(leaves)
}

/// The scatter/gather traversal. Enumerate leaf paths beneath `seed`,
/// truncate the trailing `gather_depth` segments of each (clamped to the
/// available height), deduplicate, and keep only paths whose node is fully
/// ready. Returned paths are absolute from `root`.
pub async fn get_ready_data_nodes<S: TreeStore>(
    store: &S,
    root: DataNodeId,
    seed: &DataPath,
    gather_depth: u32,
) -> Result<Vec<ReadyNode>, SaveError> {
    let seed_node = match get_node(store, root, seed).await {
        Ok(node) => node,
        // Nothing materialized beneath an absent seed: nothing ready yet.
        Err(SaveError::Data(DataError::MissingBranch { .. }))
        | Err(SaveError::Data(DataError::UnknownDegree { .. })) => return Ok(Vec::new()),
        Err(other) => return Err(other),
    };

    let leaves = leaf_paths(store, seed_node.id).await?;
    let mut group_paths: Vec<DataPath> = Vec::new();
    for (leaf_path, _) in &leaves {
        let grouped = leaf_path.gather(gather_depth as usize);
        if !group_paths.contains(&grouped) {
            group_paths.push(grouped);
        }
    }

    let mut ready = Vec::new();
    for group in group_paths {
        let node = get_node(store, seed_node.id, &group).await?;
        if is_ready(store, node.id).await? {
            ready.push(ReadyNode {
                path: seed.join(&group),
                node: node.id,
            });
        }
    }
    Ok(ready)
}

/// Structural deep copy of the subtree at `node`, sharing data object
/// references. The copy is private: nothing else points into it.
pub async fn clone_subtree<S: TreeStore>(
    store: &S,
    node: DataNodeId,
) -> Result<DataNodeId, SaveError> {
    let source = read_node(store, node).await?;
    let mut root = source.clone();
    root.id = DataNodeId::new();
    root.parent = None;
    root.index = 0;
    let new_root = root.id;

    // (source child, copied parent, index) pairs still to copy.
    let mut pending: Vec<(DataNodeId, DataNodeId, u32)> = Vec::new();
    for (index, slot) in source.children.iter().enumerate() {
        if let Some(child) = slot {
            pending.push((*child, new_root, index as u32));
        }
    }
    root.children = vec![None; root.children.len()];
    let mut copies = vec![root];

    while let Some((source_id, parent_copy, index)) = pending.pop() {
        let source = read_node(store, source_id).await?;
        let mut copy = source.clone();
        copy.id = DataNodeId::new();
        copy.parent = Some(parent_copy);
        copy.index = index;
        for (child_index, slot) in source.children.iter().enumerate() {
            if let Some(child) = slot {
                pending.push((*child, copy.id, child_index as u32));
            }
        }
        copy.children = vec![None; copy.children.len()];
        let copy_id = copy.id;
        copies.push(copy);
        // Link into the already-collected parent copy.
        let parent = copies
            .iter_mut()
            .find(|node| node.id == parent_copy)
            .expect("parent copied before child");
        parent.children[index as usize] = Some(copy_id);
    }

    for copy in copies {
        EntityOps::<DataNode>::insert(store, copy).await?;
    }
    Ok(new_root)
}

/// Copy that collapses all leaves beneath `node` into a single new
/// degree-N array, losing the original nesting. A lone leaf clones to a
/// standalone leaf root.
pub async fn flattened_clone<S: TreeStore>(
    store: &S,
    node: DataNodeId,
) -> Result<DataNodeId, SaveError> {
    let source = read_node(store, node).await?;
    let leaves = leaf_paths(store, node).await?;

    if source.is_leaf() {
        let mut copy = source;
        copy.id = DataNodeId::new();
        copy.parent = None;
        copy.index = 0;
        let id = copy.id;
        EntityOps::<DataNode>::insert(store, copy).await?;
        return Ok(id);
    }

    let degree = leaves.len() as u32;
    let mut root = DataNode::blank_root(source.data_type);
    root.degree = Some(degree);
    root.children = vec![None; leaves.len()];
    let root_id = root.id;

    let mut children = Vec::with_capacity(leaves.len());
    for (index, (_, leaf_id)) in leaves.iter().enumerate() {
        let leaf = read_node(store, *leaf_id).await?;
        let mut copy = leaf;
        copy.id = DataNodeId::new();
        copy.parent = Some(root_id);
        copy.index = index as u32;
        root.children[index] = Some(copy.id);
        children.push(copy);
    }

    EntityOps::<DataNode>::insert(store, root).await?;
    for child in children {
        EntityOps::<DataNode>::insert(store, child).await?;
    }
    Ok(root_id)
}
