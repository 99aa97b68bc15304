//! Named resource handles shared between passes of one frame.

use std::collections::HashMap;

use super::resource::RenderGraphHandle;

#[derive(Debug, Default)]
pub struct BlackBoard {
    entries: HashMap<String, RenderGraphHandle>,
}

impl BlackBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `handle` under `name`, replacing any previous entry.
    pub fn add(&mut self, name: impl Into<String>, handle: RenderGraphHandle) {
        self.entries.insert(name.into(), handle);
    }

    /// Panics if nothing was published under `name`.
    pub fn get(&self, name: &str) -> RenderGraphHandle {
        match self.entries.get(name) {
            Some(handle) => *handle,
            None => panic!("Cannot retrieve from blackboard: resource name {} not found", name),
        }
    }

    pub fn try_get(&self, name: &str) -> Option<RenderGraphHandle> {
        self.entries.get(name).copied()
    }

    /// Panics if nothing was published under `name`.
    pub fn remove(&mut self, name: &str) {
        if self.entries.remove(name).is_none() {
            panic!("Cannot remove from blackboard: resource name {} not found", name);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_remove() {
        let mut board = BlackBoard::new();
        board.add("gbuffer", RenderGraphHandle(3));
        assert_eq!(board.get("gbuffer"), RenderGraphHandle(3));
        board.add("gbuffer", RenderGraphHandle(4));
        assert_eq!(board.get("gbuffer"), RenderGraphHandle(4));
        board.remove("gbuffer");
        assert!(board.try_get("gbuffer").is_none());
        assert!(board.is_empty());
    }

    #[test]
    #[should_panic(expected = "not found")]
    fn test_missing_entry() {
        BlackBoard::new().get("bloom");
    }
}
