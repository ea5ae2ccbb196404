//! The tree model holding a parsed image.
//!
//! Nodes live in an arena and are addressed by stable [`NodeId`]s; a child stores its parent's
//! id, so there are no ownership cycles and ids stay valid for the life of the model. The model
//! is passive: the parser and the edit operations are the only writers, and every structural
//! change bumps a revision counter so a view can tell when to refresh.

use crate::types::{Action, Compression, InsertMode, ItemType, Subtype};

/// Stable identity of a node within one [`TreeModel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug)]
struct TreeItem {
    item_type: ItemType,
    subtype: Subtype,
    name: String,
    text: String,
    info: String,
    header: Vec<u8>,
    body: Vec<u8>,
    compression: Compression,
    dictionary_size: u32,
    action: Action,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Arena-backed ordered tree of typed items.
#[derive(Debug)]
pub struct TreeModel {
    items: Vec<TreeItem>,
    revision: u64,
}

impl Default for TreeModel {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeModel {
    /// Creates a model holding only the root item.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: vec![TreeItem {
                item_type: ItemType::Root,
                subtype: Subtype::None,
                name: String::new(),
                text: String::new(),
                info: String::new(),
                header: Vec::new(),
                body: Vec::new(),
                compression: Compression::None,
                dictionary_size: 0,
                action: Action::NoAction,
                parent: None,
                children: Vec::new(),
            }],
            revision: 0,
        }
    }

    /// The root item, which only ever holds the top-level image or capsule.
    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Monotonic counter bumped on every structural change, for observers to poll.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn item(&self, index: NodeId) -> &TreeItem {
        &self.items[index.0]
    }

    fn item_mut(&mut self, index: NodeId) -> &mut TreeItem {
        &mut self.items[index.0]
    }

    /// Adds an item relative to `target`: as a child for [`InsertMode::Append`] /
    /// [`InsertMode::Prepend`], as a sibling for [`InsertMode::Before`] / [`InsertMode::After`].
    #[allow(clippy::too_many_arguments)]
    pub fn add_item(
        &mut self, item_type: ItemType, subtype: Subtype, compression: Compression, name: &str,
        text: &str, info: &str, header: &[u8], body: &[u8], target: NodeId, mode: InsertMode,
    ) -> NodeId {
        let new_id = NodeId(self.items.len());
        let parent = match mode {
            InsertMode::Append | InsertMode::Prepend => target,
            InsertMode::Before | InsertMode::After => {
                self.item(target).parent.unwrap_or_else(|| self.root())
            }
        };

        self.items.push(TreeItem {
            item_type,
            subtype,
            name: name.to_owned(),
            text: text.to_owned(),
            info: info.to_owned(),
            header: header.to_vec(),
            body: body.to_vec(),
            compression,
            dictionary_size: 0,
            action: Action::NoAction,
            parent: Some(parent),
            children: Vec::new(),
        });

        let siblings = &mut self.item_mut(parent).children;
        match mode {
            InsertMode::Append => siblings.push(new_id),
            InsertMode::Prepend => siblings.insert(0, new_id),
            InsertMode::Before => {
                let at = siblings.iter().position(|&id| id == target).unwrap_or(0);
                siblings.insert(at, new_id);
            }
            InsertMode::After => {
                let at = siblings
                    .iter()
                    .position(|&id| id == target)
                    .map_or(siblings.len(), |found| found + 1);
                siblings.insert(at, new_id);
            }
        }
        self.revision += 1;
        new_id
    }

    /// Walks up from `index` to the nearest ancestor of the wanted type, including `index`
    /// itself.
    #[must_use]
    pub fn find_parent_of_type(&self, index: NodeId, item_type: ItemType) -> Option<NodeId> {
        let mut current = Some(index);
        while let Some(id) = current {
            if self.item(id).item_type == item_type {
                return Some(id);
            }
            current = self.item(id).parent;
        }
        None
    }

    #[must_use]
    pub fn item_type(&self, index: NodeId) -> ItemType {
        self.item(index).item_type
    }

    #[must_use]
    pub fn subtype(&self, index: NodeId) -> Subtype {
        self.item(index).subtype
    }

    pub fn set_subtype(&mut self, index: NodeId, subtype: Subtype) {
        self.item_mut(index).subtype = subtype;
    }

    #[must_use]
    pub fn name(&self, index: NodeId) -> &str {
        &self.item(index).name
    }

    pub fn set_name(&mut self, index: NodeId, name: &str) {
        self.item_mut(index).name = name.to_owned();
    }

    #[must_use]
    pub fn text(&self, index: NodeId) -> &str {
        &self.item(index).text
    }

    pub fn set_text(&mut self, index: NodeId, text: &str) {
        self.item_mut(index).text = text.to_owned();
    }

    #[must_use]
    pub fn info(&self, index: NodeId) -> &str {
        &self.item(index).info
    }

    pub fn set_info(&mut self, index: NodeId, info: &str) {
        self.item_mut(index).info = info.to_owned();
    }

    pub fn add_info(&mut self, index: NodeId, info: &str) {
        self.item_mut(index).info.push_str(info);
    }

    #[must_use]
    pub fn header(&self, index: NodeId) -> &[u8] {
        &self.item(index).header
    }

    #[must_use]
    pub fn has_empty_header(&self, index: NodeId) -> bool {
        self.item(index).header.is_empty()
    }

    #[must_use]
    pub fn body(&self, index: NodeId) -> &[u8] {
        &self.item(index).body
    }

    #[must_use]
    pub fn has_empty_body(&self, index: NodeId) -> bool {
        self.item(index).body.is_empty()
    }

    #[must_use]
    pub fn compression(&self, index: NodeId) -> Compression {
        self.item(index).compression
    }

    #[must_use]
    pub fn dictionary_size(&self, index: NodeId) -> u32 {
        self.item(index).dictionary_size
    }

    pub fn set_dictionary_size(&mut self, index: NodeId, dictionary_size: u32) {
        self.item_mut(index).dictionary_size = dictionary_size;
    }

    #[must_use]
    pub fn action(&self, index: NodeId) -> Action {
        self.item(index).action
    }

    /// Sets the editor intent on a node.
    ///
    /// [`Action::Insert`] cascades to every descendant, and any action other than
    /// [`Action::NoAction`] promotes still-untouched ancestors to [`Action::Rebuild`] so the
    /// reconstructor knows the enclosing containers need their sizes and checksums redone.
    pub fn set_action(&mut self, index: NodeId, action: Action) {
        self.item_mut(index).action = action;
        self.revision += 1;

        if action == Action::Insert {
            let mut pending = self.item(index).children.clone();
            while let Some(child) = pending.pop() {
                self.item_mut(child).action = Action::Insert;
                pending.extend_from_slice(&self.item(child).children.clone());
            }
        }

        if action != Action::NoAction {
            let mut current = self.item(index).parent;
            while let Some(parent) = current {
                let item = self.item_mut(parent);
                if item.item_type == ItemType::Root || item.action != Action::NoAction {
                    break;
                }
                item.action = Action::Rebuild;
                current = item.parent;
            }
        }
    }

    #[must_use]
    pub fn parent(&self, index: NodeId) -> Option<NodeId> {
        self.item(index).parent
    }

    #[must_use]
    pub fn children(&self, index: NodeId) -> &[NodeId] {
        &self.item(index).children
    }

    #[must_use]
    pub fn child_count(&self, index: NodeId) -> usize {
        self.item(index).children.len()
    }

    #[must_use]
    pub fn child(&self, index: NodeId, row: usize) -> Option<NodeId> {
        self.item(index).children.get(row).copied()
    }

    /// Position of `index` among its siblings.
    #[must_use]
    pub fn row(&self, index: NodeId) -> usize {
        match self.item(index).parent {
            Some(parent) => {
                self.item(parent).children.iter().position(|&id| id == index).unwrap_or(0)
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_plain(model: &mut TreeModel, item_type: ItemType, target: NodeId, mode: InsertMode) -> NodeId {
        model.add_item(item_type, Subtype::None, Compression::None, "", "", "", &[], &[], target, mode)
    }

    #[test]
    fn insert_modes() {
        let mut model = TreeModel::new();
        let root = model.root();
        let first = add_plain(&mut model, ItemType::Volume, root, InsertMode::Append);
        let second = add_plain(&mut model, ItemType::Volume, root, InsertMode::Append);
        let before = add_plain(&mut model, ItemType::Volume, second, InsertMode::Before);
        let after = add_plain(&mut model, ItemType::Volume, first, InsertMode::After);
        let front = add_plain(&mut model, ItemType::Volume, root, InsertMode::Prepend);

        assert_eq!(model.children(root), &[front, first, after, before, second]);
        assert_eq!(model.row(after), 2);
        assert_eq!(model.parent(before), Some(root));
    }

    #[test]
    fn action_cascade() {
        let mut model = TreeModel::new();
        let root = model.root();
        let volume = add_plain(&mut model, ItemType::Volume, root, InsertMode::Append);
        let file = add_plain(&mut model, ItemType::File, volume, InsertMode::Append);
        let section = add_plain(&mut model, ItemType::Section, file, InsertMode::Append);

        model.set_action(file, Action::Insert);
        assert_eq!(model.action(section), Action::Insert);
        assert_eq!(model.action(volume), Action::Rebuild);
        assert_eq!(model.action(root), Action::NoAction);

        // A stronger existing action is not downgraded
        model.set_action(section, Action::Remove);
        assert_eq!(model.action(file), Action::Insert);
    }

    #[test]
    fn find_parent_of_type() {
        let mut model = TreeModel::new();
        let root = model.root();
        let volume = add_plain(&mut model, ItemType::Volume, root, InsertMode::Append);
        let file = add_plain(&mut model, ItemType::File, volume, InsertMode::Append);
        let section = add_plain(&mut model, ItemType::Section, file, InsertMode::Append);

        assert_eq!(model.find_parent_of_type(section, ItemType::Volume), Some(volume));
        assert_eq!(model.find_parent_of_type(section, ItemType::Section), Some(section));
        assert_eq!(model.find_parent_of_type(volume, ItemType::File), None);
    }
}
