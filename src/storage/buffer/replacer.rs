use std::fmt::Debug;

pub type FrameId = u32;

/// Eviction policy for page cache frames. Pinned frames are never offered
/// for eviction.
pub trait Replacer: Send + Sync + Debug {
    /// Select a frame to evict, or None if every frame is pinned.
    fn evict(&mut self) -> Option<FrameId>;

    /// Mark a frame as pinned (not evictable).
    fn pin(&mut self, frame_id: FrameId);

    /// Mark a frame as unpinned (evictable).
    fn unpin(&mut self, frame_id: FrameId);

    /// Number of evictable frames.
    fn size(&self) -> usize;
}
