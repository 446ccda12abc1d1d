use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

pub type FrameId = usize;

/// Hint describing why a page is being touched. Recorded with each access;
/// carries no weight in victim selection yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessType {
    #[default]
    Unknown,
    Lookup,
    Scan,
    Index,
}

#[derive(Debug)]
struct LruKNode {
    /// Timestamps of the most recent accesses, oldest first, at most K.
    history: VecDeque<u64>,
    is_evictable: bool,
}

#[derive(Debug)]
struct ReplacerState {
    nodes: HashMap<FrameId, LruKNode>,
    current_timestamp: u64,
    /// Number of nodes currently marked evictable.
    curr_size: usize,
}

/// LRU-K replacement policy over a fixed set of frames.
///
/// The victim is the evictable frame with the largest backward K-distance:
/// the age of its Kth most recent access. Frames with fewer than K recorded
/// accesses have infinite distance; ties fall back to plain LRU on the
/// oldest recorded access.
#[derive(Debug)]
pub struct LruKReplacer {
    state: Mutex<ReplacerState>,
    k: usize,
    capacity: usize,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(num_frames >= 1, "replacer needs at least one frame");
        assert!(k >= 1, "k must be at least 1");
        Self {
            state: Mutex::new(ReplacerState {
                nodes: HashMap::with_capacity(num_frames),
                current_timestamp: 0,
                curr_size: 0,
            }),
            k,
            capacity: num_frames,
        }
    }

    /// Records an access to `frame_id`, creating its node (non-evictable)
    /// on first contact. Frame ids outside the pool are a caller bug.
    pub fn record_access(&self, frame_id: FrameId, _access_type: AccessType) {
        assert!(frame_id < self.capacity, "frame id {} out of range", frame_id);
        let mut state = self.state.lock();

        state.current_timestamp += 1;
        let timestamp = state.current_timestamp;
        let k = self.k;

        let node = state.nodes.entry(frame_id).or_insert_with(|| LruKNode {
            history: VecDeque::with_capacity(k),
            is_evictable: false,
        });
        node.history.push_back(timestamp);
        if node.history.len() > k {
            node.history.pop_front();
        }
    }

    /// Marks `frame_id` evictable or not. Unknown frames are ignored.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        assert!(frame_id < self.capacity, "frame id {} out of range", frame_id);
        let mut state = self.state.lock();

        let Some(node) = state.nodes.get_mut(&frame_id) else {
            return;
        };
        if node.is_evictable != evictable {
            node.is_evictable = evictable;
            if evictable {
                state.curr_size += 1;
            } else {
                state.curr_size -= 1;
            }
        }
    }

    /// Selects a victim, removes its access history, and returns its frame
    /// id. Returns `None` when no frame is evictable.
    pub fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();
        let now = state.current_timestamp;

        let mut victim: Option<(FrameId, u64, u64)> = None;
        for (&frame_id, node) in &state.nodes {
            if !node.is_evictable {
                continue;
            }
            let oldest = *node.history.front().expect("node has at least one access");
            let k_distance = if node.history.len() >= self.k {
                now - oldest
            } else {
                u64::MAX
            };
            let better = match victim {
                None => true,
                Some((_, best_distance, best_oldest)) => {
                    k_distance > best_distance
                        || (k_distance == best_distance && oldest < best_oldest)
                }
            };
            if better {
                victim = Some((frame_id, k_distance, oldest));
            }
        }

        let (frame_id, _, _) = victim?;
        state.nodes.remove(&frame_id);
        state.curr_size -= 1;
        Some(frame_id)
    }

    /// Forgets `frame_id` entirely. Removing a frame that is tracked but
    /// pinned (non-evictable) is a caller bug; removing an unknown frame is
    /// a no-op.
    pub fn remove(&self, frame_id: FrameId) {
        assert!(frame_id < self.capacity, "frame id {} out of range", frame_id);
        let mut state = self.state.lock();

        let Some(node) = state.nodes.get(&frame_id) else {
            return;
        };
        assert!(
            node.is_evictable,
            "attempt to remove non-evictable frame {}",
            frame_id
        );
        state.nodes.remove(&frame_id);
        state.curr_size -= 1;
    }

    /// Number of frames currently evictable.
    pub fn size(&self) -> usize {
        self.state.lock().curr_size
    }
}
