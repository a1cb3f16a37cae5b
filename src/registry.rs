use crate::error::Result;

pub mod file;
pub mod in_memory;

/// Hands out the file ids stamped into newly created archives.
///
/// Ids are unique per registry and never handed out twice.
pub trait FileIdRegistry {
    fn next_file_id(&mut self) -> Result<u32>;

    /// The id the next call to [`FileIdRegistry::next_file_id`] would return.
    fn peek(&self) -> Result<u32>;
}
