use serde::{Deserialize, Serialize};

/// Logical identifier of a page on disk. A page is resident in a frame
/// when cached by the buffer pool; a frame holding no page carries
/// `None` instead of a sentinel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PageId({})", self.0)
    }
}
