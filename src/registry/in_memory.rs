use crate::error::Result;

use super::FileIdRegistry;

/// A [`FileIdRegistry`] that forgets everything when dropped.
#[derive(Debug, Clone)]
pub struct InMemoryFileIdRegistry {
    next: u32,
}

impl InMemoryFileIdRegistry {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(next: u32) -> Self {
        Self { next }
    }
}

impl Default for InMemoryFileIdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIdRegistry for InMemoryFileIdRegistry {
    fn next_file_id(&mut self) -> Result<u32> {
        let id = self.next;
        self.next += 1;
        Ok(id)
    }

    fn peek(&self) -> Result<u32> {
        Ok(self.next)
    }
}

#[test]
fn test_in_memory_registry() {
    let mut registry = InMemoryFileIdRegistry::new();
    assert_eq!(registry.next_file_id().unwrap(), 1);
    assert_eq!(registry.next_file_id().unwrap(), 2);
    assert_eq!(registry.peek().unwrap(), 3);

    let mut other = InMemoryFileIdRegistry::starting_at(100);
    assert_eq!(other.next_file_id().unwrap(), 100);
    assert_eq!(registry.peek().unwrap(), 3);
}
