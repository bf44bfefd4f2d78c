use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{
    FileId, FileIndex, Index, IndexKind, PermissionType, SharedLink, TreeError, UserPermission,
};
use crate::codec::BlockEncoded;
use crate::crypto::KeyPair;

/// Arena of index nodes rooted at a single folder
///
/// Encoded as a flat node list; the id map and parent links are checked
/// and rebuilt on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "TreeBlock", try_from = "TreeBlock")]
pub struct IndexTree {
    owner: String,
    root: FileId,
    nodes: HashMap<FileId, Index>,
}

#[derive(Serialize, Deserialize)]
struct TreeBlock {
    owner: String,
    root: FileId,
    nodes: Vec<Index>,
}

impl From<IndexTree> for TreeBlock {
    fn from(tree: IndexTree) -> Self {
        Self {
            owner: tree.owner,
            root: tree.root,
            nodes: tree.nodes.into_values().collect(),
        }
    }
}

impl TryFrom<TreeBlock> for IndexTree {
    type Error = TreeError;

    fn try_from(block: TreeBlock) -> Result<Self, Self::Error> {
        let nodes: HashMap<FileId, Index> =
            block.nodes.into_iter().map(|node| (node.id, node)).collect();

        let root = nodes
            .get(&block.root)
            .ok_or_else(|| TreeError::Malformed("root node missing".into()))?;
        if !root.is_folder() || root.parent.is_some() {
            return Err(TreeError::Malformed("root must be a parentless folder".into()));
        }

        for node in nodes.values() {
            if node.id != block.root {
                let parent = node
                    .parent
                    .and_then(|parent| nodes.get(&parent))
                    .ok_or_else(|| TreeError::Malformed(format!("orphan node {:?}", node.id)))?;
                let linked = parent
                    .as_folder()
                    .and_then(|folder| folder.children.get(&node.name))
                    == Some(&node.id);
                if !linked {
                    return Err(TreeError::Malformed(format!(
                        "node {:?} is not listed by its parent",
                        node.id
                    )));
                }
            }
            if let Some(folder) = node.as_folder() {
                for child in folder.children.values() {
                    if nodes.get(child).and_then(|c| c.parent) != Some(node.id) {
                        return Err(TreeError::Malformed(format!(
                            "child {:?} does not point back at {:?}",
                            child, node.id
                        )));
                    }
                }
            }
        }

        Ok(Self {
            owner: block.owner,
            root: block.root,
            nodes,
        })
    }
}

impl BlockEncoded for IndexTree {
    const KIND: &'static str = "index tree";
}

impl IndexTree {
    /// An empty tree: just a root folder
    pub fn new(owner: impl Into<String>, protection_keys: Option<KeyPair>) -> Self {
        let mut root = Index::folder("");
        root.protection_keys = protection_keys;
        let root_id = root.id;
        Self {
            owner: owner.into(),
            root: root_id,
            nodes: HashMap::from([(root_id, root)]),
        }
    }

    /* Getters */

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn root_id(&self) -> FileId {
        self.root
    }

    pub fn root(&self) -> &Index {
        &self.nodes[&self.root]
    }

    pub fn get(&self, id: &FileId) -> Option<&Index> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &FileId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn node(&self, id: &FileId) -> Result<&Index, TreeError> {
        self.nodes
            .get(id)
            .ok_or_else(|| TreeError::NotFound(format!("node {:?}", id)))
    }

    fn node_mut(&mut self, id: &FileId) -> Result<&mut Index, TreeError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| TreeError::NotFound(format!("node {:?}", id)))
    }

    fn folder_children_mut(
        &mut self,
        id: &FileId,
    ) -> Result<&mut BTreeMap<String, FileId>, TreeError> {
        let described = self.describe(id);
        match &mut self.node_mut(id)?.kind {
            IndexKind::Folder(folder) => Ok(&mut folder.children),
            IndexKind::File(_) => Err(TreeError::NotAFolder(described)),
        }
    }

    /// Human readable location for error messages
    fn describe(&self, id: &FileId) -> String {
        match self.path_of(id) {
            Some(path) if path.as_os_str().is_empty() => "/".to_string(),
            Some(path) => format!("/{}", path.display()),
            None => format!("node {:?}", id),
        }
    }

    /* Paths */

    /// Find a node by its path relative to the root. A leading `/` is ignored
    pub fn resolve(&self, path: &Path) -> Option<FileId> {
        let mut current = self.root;
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => continue,
                Component::Normal(name) => {
                    current = self.child(&current, name.to_str()?)?;
                }
                Component::ParentDir | Component::Prefix(_) => return None,
            }
        }
        Some(current)
    }

    pub fn get_by_path(&self, path: &Path) -> Option<&Index> {
        self.resolve(path).and_then(|id| self.nodes.get(&id))
    }

    /// Path of a node relative to the root; the root itself is the empty path
    pub fn path_of(&self, id: &FileId) -> Option<PathBuf> {
        let mut names = Vec::new();
        let mut current = self.nodes.get(id)?;
        while let Some(parent) = current.parent {
            names.push(current.name.as_str());
            current = self.nodes.get(&parent)?;
        }
        Some(names.into_iter().rev().collect())
    }

    pub fn child(&self, parent: &FileId, name: &str) -> Option<FileId> {
        self.nodes
            .get(parent)?
            .as_folder()?
            .children
            .get(name)
            .copied()
    }

    pub fn children(&self, id: &FileId) -> Vec<&Index> {
        self.nodes
            .get(id)
            .and_then(|node| node.as_folder())
            .map(|folder| {
                folder
                    .children
                    .values()
                    .filter_map(|child| self.nodes.get(child))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The node itself, then each parent up to the root
    pub fn ancestors(&self, id: &FileId) -> Vec<FileId> {
        let mut out = Vec::new();
        let mut current = self.nodes.get(id);
        while let Some(node) = current {
            out.push(node.id);
            current = node.parent.and_then(|parent| self.nodes.get(&parent));
        }
        out
    }

    /// The node and everything below it, parents before children
    pub fn descendants(&self, id: &FileId) -> Vec<FileId> {
        let mut out = Vec::new();
        let mut stack = vec![*id];
        while let Some(next) = stack.pop() {
            let Some(node) = self.nodes.get(&next) else {
                continue;
            };
            out.push(next);
            if let Some(folder) = node.as_folder() {
                stack.extend(folder.children.values().rev().copied());
            }
        }
        out
    }

    /// Whether `node` is `ancestor` or lies below it
    pub fn is_within(&self, node: &FileId, ancestor: &FileId) -> bool {
        self.ancestors(node).contains(ancestor)
    }

    /// Every file in the subtree at `id`
    pub fn files_in(&self, id: &FileId) -> Vec<&Index> {
        self.descendants(id)
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|node| node.is_file())
            .collect()
    }

    /* Structural mutation */

    /// Add `index` under `parent`, inheriting the parent's protection keys
    pub fn insert(&mut self, parent: &FileId, mut index: Index) -> Result<FileId, TreeError> {
        if self.nodes.contains_key(&index.id) {
            return Err(TreeError::AlreadyExists(format!("node {:?}", index.id)));
        }
        let keys = self.node(parent)?.protection_keys.clone();
        let described = format!("{}/{}", self.describe(parent).trim_end_matches('/'), index.name);
        let children = self.folder_children_mut(parent)?;
        if children.contains_key(&index.name) {
            return Err(TreeError::AlreadyExists(described));
        }
        children.insert(index.name.clone(), index.id);

        let id = index.id;
        index.parent = Some(*parent);
        index.protection_keys = keys;
        self.nodes.insert(id, index);
        Ok(id)
    }

    /// Remove the subtree at `id` and hand it back as a tree of its own
    pub fn detach(&mut self, id: &FileId) -> Result<IndexTree, TreeError> {
        if *id == self.root {
            return Err(TreeError::RootImmutable);
        }
        let node = self.node(id)?;
        let parent = node.parent.ok_or_else(|| TreeError::Malformed("parentless node".into()))?;
        let name = node.name.clone();

        let ids = self.descendants(id);
        self.folder_children_mut(&parent)?.remove(&name);

        let mut nodes = HashMap::with_capacity(ids.len());
        for child in ids {
            if let Some(node) = self.nodes.remove(&child) {
                nodes.insert(child, node);
            }
        }
        if let Some(root) = nodes.get_mut(id) {
            root.parent = None;
        }
        Ok(IndexTree {
            owner: self.owner.clone(),
            root: *id,
            nodes,
        })
    }

    /// Copy of the subtree at `id`, owned by `owner`
    pub fn subtree(&self, id: &FileId, owner: &str) -> Result<IndexTree, TreeError> {
        self.node(id)?;
        let mut nodes: HashMap<FileId, Index> = self
            .descendants(id)
            .into_iter()
            .filter_map(|child| self.nodes.get(&child).map(|node| (child, node.clone())))
            .collect();
        if let Some(root) = nodes.get_mut(id) {
            root.parent = None;
        }
        Ok(IndexTree {
            owner: owner.to_string(),
            root: *id,
            nodes,
        })
    }

    /// Hang a detached subtree under `parent` as `name`
    pub fn graft(
        &mut self,
        parent: &FileId,
        name: &str,
        subtree: IndexTree,
    ) -> Result<FileId, TreeError> {
        if let Some(clash) = subtree.nodes.keys().find(|id| self.nodes.contains_key(id)) {
            return Err(TreeError::AlreadyExists(format!("node {:?}", clash)));
        }
        let described = format!("{}/{}", self.describe(parent).trim_end_matches('/'), name);
        let children = self.folder_children_mut(parent)?;
        if children.contains_key(name) {
            return Err(TreeError::AlreadyExists(described));
        }
        children.insert(name.to_string(), subtree.root);

        let root = subtree.root;
        self.nodes.extend(subtree.nodes);
        let node = self.node_mut(&root)?;
        node.parent = Some(*parent);
        node.name = name.to_string();
        Ok(root)
    }

    /// Swap the placeholder at `id` for the full subtree it stands for.
    ///  The placeholder keeps its place and name
    pub fn replace(&mut self, id: &FileId, subtree: IndexTree) -> Result<(), TreeError> {
        if subtree.root != *id {
            return Err(TreeError::Malformed(format!(
                "subtree root {:?} does not match placeholder {:?}",
                subtree.root, id
            )));
        }
        let placeholder = self.node(id)?.clone();
        let parent = placeholder
            .parent
            .ok_or_else(|| TreeError::Malformed("cannot replace the root".into()))?;
        let link = placeholder.shared_link().cloned();

        self.detach(id)?;
        if let Err(err) = self.graft(&parent, &placeholder.name, subtree) {
            // put the placeholder back
            self.nodes.insert(placeholder.id, placeholder.clone());
            self.folder_children_mut(&parent)?
                .insert(placeholder.name.clone(), placeholder.id);
            return Err(err);
        }
        if let IndexKind::Folder(folder) = &mut self.node_mut(id)?.kind {
            if folder.link.is_none() {
                folder.link = link;
            }
        }
        Ok(())
    }

    /// Drop everything below `id`, leaving it as an empty folder
    pub fn prune(&mut self, id: &FileId) -> Result<(), TreeError> {
        let below: Vec<FileId> = self.descendants(id).into_iter().skip(1).collect();
        for child in below {
            self.nodes.remove(&child);
        }
        self.folder_children_mut(id)?.clear();
        Ok(())
    }

    /// Move and/or rename a node inside this tree
    pub fn relocate(
        &mut self,
        id: &FileId,
        new_parent: &FileId,
        new_name: &str,
    ) -> Result<(), TreeError> {
        if *id == self.root {
            return Err(TreeError::RootImmutable);
        }
        if self.is_within(new_parent, id) {
            return Err(TreeError::MoveIntoSelf {
                from: self.describe(id),
                to: format!("{}/{}", self.describe(new_parent).trim_end_matches('/'), new_name),
            });
        }
        let described = format!(
            "{}/{}",
            self.describe(new_parent).trim_end_matches('/'),
            new_name
        );
        if self.node(new_parent)?.as_folder().is_none() {
            return Err(TreeError::NotAFolder(self.describe(new_parent)));
        }
        if self.child(new_parent, new_name).is_some() {
            return Err(TreeError::AlreadyExists(described));
        }

        let node = self.node(id)?;
        let old_parent = node.parent.ok_or_else(|| TreeError::Malformed("parentless node".into()))?;
        let old_name = node.name.clone();

        self.folder_children_mut(&old_parent)?.remove(&old_name);
        self.folder_children_mut(new_parent)?
            .insert(new_name.to_string(), *id);
        let node = self.node_mut(id)?;
        node.parent = Some(*new_parent);
        node.name = new_name.to_string();
        Ok(())
    }

    /* Node attributes */

    /// Replace a file's content metadata
    pub fn set_content(&mut self, id: &FileId, file: FileIndex) -> Result<FileIndex, TreeError> {
        let described = self.describe(id);
        match &mut self.node_mut(id)?.kind {
            IndexKind::File(existing) => Ok(std::mem::replace(existing, file)),
            IndexKind::Folder(_) => Err(TreeError::NotFound(format!("file {}", described))),
        }
    }

    /// Assign protection keys to a whole subtree
    pub fn set_protection(&mut self, id: &FileId, keys: Option<KeyPair>) {
        for child in self.descendants(id) {
            if let Some(node) = self.nodes.get_mut(&child) {
                node.protection_keys = keys.clone();
            }
        }
    }

    pub fn set_permissions(
        &mut self,
        id: &FileId,
        permissions: BTreeMap<String, PermissionType>,
    ) -> Result<(), TreeError> {
        self.node_mut(id)?.permissions = permissions;
        Ok(())
    }

    /// Add or override one user's explicit permission at `id`
    pub fn set_permission(
        &mut self,
        id: &FileId,
        user_id: &str,
        permission: PermissionType,
    ) -> Result<(), TreeError> {
        self.node_mut(id)?
            .permissions
            .insert(user_id.to_string(), permission);
        Ok(())
    }

    pub fn set_link(&mut self, id: &FileId, link: Option<SharedLink>) -> Result<(), TreeError> {
        let described = self.describe(id);
        match &mut self.node_mut(id)?.kind {
            IndexKind::Folder(folder) => {
                folder.link = link;
                Ok(())
            }
            IndexKind::File(_) => Err(TreeError::NotAFolder(described)),
        }
    }

    /* Permissions */

    /// Effective permissions at `id`
    ///
    /// Each user gets the permission of the nearest node (inclusive) that
    /// names them explicitly. Where no node on the path carries explicit
    /// permissions the tree owner holds WRITE.
    pub fn calculated_permissions(&self, id: &FileId) -> BTreeSet<UserPermission> {
        let mut seen: BTreeMap<&str, PermissionType> = BTreeMap::new();
        for ancestor in self.ancestors(id) {
            for (user, permission) in &self.nodes[&ancestor].permissions {
                seen.entry(user.as_str()).or_insert(*permission);
            }
        }
        if seen.is_empty() && self.nodes.contains_key(id) {
            seen.insert(self.owner.as_str(), PermissionType::Write);
        }
        seen.into_iter()
            .map(|(user, permission)| UserPermission::new(user, permission))
            .collect()
    }

    pub fn permission_of(&self, id: &FileId, user_id: &str) -> Option<PermissionType> {
        self.calculated_permissions(id)
            .into_iter()
            .find(|p| p.user_id == user_id)
            .map(|p| p.permission)
    }

    pub fn can_write(&self, id: &FileId, user_id: &str) -> bool {
        self.permission_of(id, user_id) == Some(PermissionType::Write)
    }

    /// True iff the node or an ancestor carries explicit permissions
    pub fn is_shared(&self, id: &FileId) -> bool {
        self.ancestors(id)
            .iter()
            .any(|ancestor| !self.nodes[ancestor].permissions.is_empty())
    }

    pub fn calculated_user_list(&self, id: &FileId) -> BTreeSet<String> {
        self.calculated_permissions(id)
            .into_iter()
            .map(|p| p.user_id)
            .collect()
    }

    /* Shared folders */

    /// The nearest shared-folder root at or above `id`
    pub fn mount_root_of(&self, id: &FileId) -> Option<FileId> {
        self.ancestors(id)
            .into_iter()
            .find(|ancestor| self.nodes[ancestor].shared_link().is_some())
    }

    pub fn mount_roots(&self) -> Vec<FileId> {
        self.nodes
            .values()
            .filter(|node| node.shared_link().is_some())
            .map(|node| node.id)
            .collect()
    }

    /// Whether a shared-folder root lies strictly below `id`
    pub fn contains_mount_below(&self, id: &FileId) -> bool {
        self.descendants(id)
            .iter()
            .skip(1)
            .any(|child| self.nodes[child].shared_link().is_some())
    }
}
