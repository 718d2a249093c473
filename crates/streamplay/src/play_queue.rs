//! Upcoming tracks plus play history.
//!
//! Index 0 of the queue is the track playing (or about to play). Completing it moves it
//! to the front of the history; `play_last_song` moves it back. Every entry gets a slot
//! number on insertion, so the same track queued twice still occupies two distinct slots
//! and shuffle can restore the exact previous order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use streamplay_types::Track;

type QueueCallback = Arc<dyn Fn(&[Track]) + Send + Sync>;
type HistoryCallback = Arc<dyn Fn(&[Track]) + Send + Sync>;

/// Direction for [`Queue::reorder`]. `Earlier` moves toward the head.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Earlier,
    Later,
}

#[derive(Clone, Debug)]
struct Entry {
    slot: u64,
    track: Track,
}

#[derive(Default)]
struct QueueState {
    items: Vec<Entry>,
    history: VecDeque<Track>,
    next_slot: u64,
    /// Slot order captured when shuffle was enabled.
    unshuffled: Option<Vec<u64>>,
}

impl QueueState {
    fn entries(&mut self, tracks: &[Track]) -> Vec<Entry> {
        tracks
            .iter()
            .map(|track| {
                self.next_slot += 1;
                Entry {
                    slot: self.next_slot,
                    track: track.clone(),
                }
            })
            .collect()
    }

    fn tracks(&self) -> Vec<Track> {
        self.items.iter().map(|e| e.track.clone()).collect()
    }

    fn history(&self) -> Vec<Track> {
        self.history.iter().cloned().collect()
    }
}

/// What a mutation changed; drives which callbacks fire.
#[derive(Default)]
struct Changes {
    queue: Option<Vec<Track>>,
    history: Option<Vec<Track>>,
}

#[derive(Default)]
pub struct Queue {
    state: RwLock<QueueState>,
    queue_changed: Mutex<Vec<QueueCallback>>,
    history_changed: Mutex<Option<HistoryCallback>>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with a snapshot of the queue after each change.
    pub fn add_queue_changed_callback(&self, cb: impl Fn(&[Track]) + Send + Sync + 'static) {
        self.queue_changed.lock().push(Arc::new(cb));
    }

    /// Called with a snapshot of the history after each change.
    pub fn set_history_changed_callback(&self, cb: impl Fn(&[Track]) + Send + Sync + 'static) {
        *self.history_changed.lock() = Some(Arc::new(cb));
    }

    /// Append to the end of the queue.
    pub fn add_songs(&self, tracks: &[Track]) {
        if tracks.is_empty() {
            return;
        }
        self.mutate(|st| {
            let new = st.entries(tracks);
            st.items.extend(new);
            tracing::debug!(added = tracks.len(), len = st.items.len(), "queue: add songs");
            queue_only(st)
        });
    }

    /// Insert right after the current head, keeping `tracks` in order.
    pub fn play_next(&self, tracks: &[Track]) {
        if tracks.is_empty() {
            return;
        }
        self.mutate(|st| {
            let new = st.entries(tracks);
            if st.items.is_empty() {
                st.items.extend(new);
            } else {
                st.items.splice(1..1, new);
            }
            tracing::debug!(added = tracks.len(), "queue: play next");
            queue_only(st)
        });
    }

    /// Remove the entry at `index`; out-of-range indices are ignored.
    pub fn remove_song(&self, index: usize) {
        self.mutate(|st| {
            if index >= st.items.len() {
                return Changes::default();
            }
            let removed = st.items.remove(index);
            tracing::debug!(index, track = %removed.track.name, "queue: remove song");
            queue_only(st)
        });
    }

    /// Swap the entry at `index` with its neighbour.
    ///
    /// The head never moves, and while it is playing nothing may be moved in front of it.
    pub fn reorder(&self, index: usize, direction: Direction, head_playing: bool) -> bool {
        if index == 0 || (index == 1 && direction == Direction::Earlier && head_playing) {
            return false;
        }
        let mut swapped = false;
        self.mutate(|st| {
            let other = match direction {
                Direction::Earlier => index - 1,
                Direction::Later => index + 1,
            };
            if index >= st.items.len() || other >= st.items.len() {
                return Changes::default();
            }
            st.items.swap(index, other);
            swapped = true;
            queue_only(st)
        });
        swapped
    }

    /// Empty the queue, optionally keeping the head.
    pub fn clear_queue(&self, include_head: bool) {
        self.mutate(|st| {
            let keep = usize::from(!include_head).min(st.items.len());
            if st.items.len() == keep {
                return Changes::default();
            }
            st.items.truncate(keep);
            tracing::debug!(include_head, "queue: cleared");
            queue_only(st)
        });
    }

    /// Move the head onto the front of the history.
    pub fn song_complete(&self) {
        self.mutate(|st| {
            if st.items.is_empty() {
                return Changes::default();
            }
            let done = st.items.remove(0);
            st.history.push_front(done.track);
            Changes {
                queue: Some(st.tracks()),
                history: Some(st.history()),
            }
        });
    }

    /// Move the most recent history entry back onto the head.
    pub fn play_last_song(&self) {
        self.mutate(|st| {
            let Some(track) = st.history.pop_front() else {
                return Changes::default();
            };
            let entry = st.entries(std::slice::from_ref(&track));
            st.items.splice(0..0, entry);
            Changes {
                queue: Some(st.tracks()),
                history: Some(st.history()),
            }
        });
    }

    /// Shuffle everything after the head, or restore the order captured when shuffle
    /// was turned on. Entries added while shuffled keep their order at the end.
    pub fn set_shuffle(&self, enabled: bool) {
        self.mutate(|st| {
            if enabled == st.unshuffled.is_some() {
                return Changes::default();
            }
            if enabled {
                st.unshuffled = Some(st.items.iter().map(|e| e.slot).collect());
                if st.items.len() > 2 {
                    st.items[1..].shuffle(&mut rand::rng());
                }
            } else if let Some(order) = st.unshuffled.take() {
                restore_order(&mut st.items, &order);
            }
            tracing::debug!(enabled, "queue: shuffle");
            queue_only(st)
        });
    }

    pub fn is_shuffled(&self) -> bool {
        self.state.read().unshuffled.is_some()
    }

    pub fn get_queue(&self) -> Vec<Track> {
        self.state.read().tracks()
    }

    /// Up to `n` most recent history entries, most recent first.
    pub fn get_history(&self, n: usize) -> Vec<Track> {
        self.state.read().history.iter().take(n).cloned().collect()
    }

    pub fn get(&self, index: usize) -> Option<Track> {
        self.state.read().items.get(index).map(|e| e.track.clone())
    }

    pub fn len(&self) -> usize {
        self.state.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().items.is_empty()
    }

    /// Sum of queued track durations, in seconds.
    pub fn total_duration(&self) -> u64 {
        self.state
            .read()
            .items
            .iter()
            .map(|e| u64::from(e.track.duration_secs))
            .sum()
    }

    /// Apply `f` under the write lock, then fire callbacks for what it changed.
    fn mutate(&self, f: impl FnOnce(&mut QueueState) -> Changes) {
        let changes = {
            let mut st = self.state.write();
            f(&mut st)
        };
        if let Some(queue) = changes.queue {
            let callbacks = self.queue_changed.lock().clone();
            for cb in callbacks {
                cb(&queue);
            }
        }
        if let Some(history) = changes.history {
            let cb = self.history_changed.lock().clone();
            if let Some(cb) = cb {
                cb(&history);
            }
        }
    }
}

fn queue_only(st: &QueueState) -> Changes {
    Changes {
        queue: Some(st.tracks()),
        history: None,
    }
}

/// Reorder `items[1..]` by each slot's position in `order`; unknown slots go last.
fn restore_order(items: &mut [Entry], order: &[u64]) {
    if items.len() < 2 {
        return;
    }
    let rank: HashMap<u64, usize> = order.iter().enumerate().map(|(i, slot)| (*slot, i)).collect();
    // Stable sort keeps entries added while shuffled in their current order.
    items[1..].sort_by_key(|e| rank.get(&e.slot).copied().unwrap_or(usize::MAX));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn track(id: &str, secs: u32) -> Track {
        Track::new(id, id.to_uppercase(), secs)
    }

    fn ids(tracks: &[Track]) -> Vec<String> {
        tracks.iter().map(|t| t.id.clone()).collect()
    }

    fn queue_of(list: &[&str]) -> Queue {
        let q = Queue::new();
        let tracks: Vec<Track> = list.iter().map(|id| track(id, 10)).collect();
        q.add_songs(&tracks);
        q
    }

    #[test]
    fn song_complete_moves_head_to_history() {
        let q = Queue::new();
        q.add_songs(&[track("a", 60), track("b", 10), track("c", 1)]);
        assert_eq!(q.total_duration(), 71);
        q.song_complete();
        assert_eq!(ids(&q.get_queue()), ["b", "c"]);
        assert_eq!(ids(&q.get_history(10)), ["a"]);
    }

    #[test]
    fn play_last_song_with_empty_history_is_noop() {
        let q = queue_of(&["a"]);
        q.play_last_song();
        assert_eq!(ids(&q.get_queue()), ["a"]);
        assert!(q.get_history(5).is_empty());
    }

    #[test]
    fn play_last_song_undoes_song_complete() {
        let q = queue_of(&["a", "b"]);
        q.song_complete();
        q.song_complete();
        assert_eq!(ids(&q.get_history(1)), ["b"]);
        q.play_last_song();
        assert_eq!(ids(&q.get_queue()), ["b"]);
        assert_eq!(ids(&q.get_history(10)), ["a"]);
    }

    #[test]
    fn play_next_inserts_after_head() {
        let q = queue_of(&["a", "b"]);
        q.play_next(&[track("x", 1), track("y", 1)]);
        assert_eq!(ids(&q.get_queue()), ["a", "x", "y", "b"]);

        let empty = Queue::new();
        empty.play_next(&[track("x", 1)]);
        assert_eq!(ids(&empty.get_queue()), ["x"]);
    }

    #[test]
    fn remove_song_ignores_bad_index() {
        let q = queue_of(&["a", "b", "c"]);
        q.remove_song(7);
        assert_eq!(q.len(), 3);
        q.remove_song(1);
        assert_eq!(ids(&q.get_queue()), ["a", "c"]);
    }

    #[test]
    fn reorder_protects_playing_head() {
        let q = queue_of(&["a", "b", "c", "d"]);
        assert!(!q.reorder(1, Direction::Earlier, true));
        assert!(!q.reorder(0, Direction::Later, false));
        assert!(q.reorder(2, Direction::Earlier, true));
        assert_eq!(ids(&q.get_queue()), ["a", "c", "b", "d"]);
        assert!(!q.reorder(3, Direction::Later, true));
        assert!(q.reorder(1, Direction::Earlier, false));
        assert_eq!(ids(&q.get_queue()), ["c", "a", "b", "d"]);
    }

    #[test]
    fn clear_queue_optionally_keeps_head() {
        let q = queue_of(&["a", "b", "c"]);
        q.clear_queue(false);
        assert_eq!(ids(&q.get_queue()), ["a"]);
        q.clear_queue(true);
        assert!(q.is_empty());
    }

    #[test]
    fn shuffle_is_a_permutation_and_restores_order() {
        let list: Vec<String> = (0..30).map(|i| format!("t{i}")).collect();
        let refs: Vec<&str> = list.iter().map(String::as_str).collect();
        let q = queue_of(&refs);

        q.set_shuffle(true);
        let shuffled = ids(&q.get_queue());
        assert_eq!(shuffled[0], "t0");
        let mut sorted = shuffled.clone();
        sorted.sort();
        let mut expected = list.clone();
        expected.sort();
        assert_eq!(sorted, expected);

        q.add_songs(&[track("late", 1)]);
        q.set_shuffle(false);
        let mut restored = list.clone();
        restored.push("late".to_string());
        assert_eq!(ids(&q.get_queue()), restored);
    }

    #[test]
    fn duplicates_keep_separate_slots_through_shuffle() {
        let q = queue_of(&["a", "b", "b", "c"]);
        q.set_shuffle(true);
        q.set_shuffle(false);
        assert_eq!(ids(&q.get_queue()), ["a", "b", "b", "c"]);
    }

    #[test]
    fn callbacks_fire_once_per_mutation_outside_lock() {
        let q = Arc::new(Queue::new());
        let queue_calls = Arc::new(AtomicUsize::new(0));
        let history_calls = Arc::new(AtomicUsize::new(0));
        let (qc, hc) = (queue_calls.clone(), history_calls.clone());
        let reentrant = Arc::downgrade(&q);
        q.add_queue_changed_callback(move |snapshot| {
            qc.fetch_add(1, Ordering::SeqCst);
            // Reading back must not deadlock.
            if let Some(q) = reentrant.upgrade() {
                assert_eq!(q.len(), snapshot.len());
            }
        });
        q.set_history_changed_callback(move |_| {
            hc.fetch_add(1, Ordering::SeqCst);
        });

        q.add_songs(&[]);
        q.add_songs(&[track("a", 1), track("b", 1)]);
        q.remove_song(9);
        q.song_complete();
        assert_eq!(queue_calls.load(Ordering::SeqCst), 2);
        assert_eq!(history_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn random_operation_sequences_match_a_plain_model() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let q = Queue::new();
            let mut queue: Vec<String> = Vec::new();
            let mut history: Vec<String> = Vec::new();
            let mut next_id = 0;

            for _ in 0..300 {
                let len = queue.len();
                match rng.random_range(0..6) {
                    0 => {
                        let n = rng.random_range(0..4);
                        let added: Vec<Track> = (0..n)
                            .map(|_| {
                                next_id += 1;
                                track(&format!("t{}", next_id % 7), 1)
                            })
                            .collect();
                        queue.extend(added.iter().map(|t| t.id.clone()));
                        q.add_songs(&added);
                    }
                    1 => {
                        next_id += 1;
                        let t = track(&format!("t{}", next_id % 7), 1);
                        let at = if queue.is_empty() { 0 } else { 1 };
                        queue.insert(at, t.id.clone());
                        q.play_next(&[t]);
                    }
                    2 => {
                        let index = rng.random_range(0..len + 2);
                        if index < len {
                            queue.remove(index);
                        }
                        q.remove_song(index);
                    }
                    3 => {
                        let index = rng.random_range(0..len + 2);
                        let direction = if rng.random_bool(0.5) { Direction::Earlier } else { Direction::Later };
                        let playing = rng.random_bool(0.5);
                        let other = match direction {
                            Direction::Earlier => index.checked_sub(1),
                            Direction::Later => Some(index + 1),
                        };
                        let allowed = index != 0 && !(index == 1 && direction == Direction::Earlier && playing);
                        let expected = match other {
                            Some(other) if allowed && index < len && other < len => {
                                queue.swap(index, other);
                                true
                            }
                            _ => false,
                        };
                        assert_eq!(q.reorder(index, direction, playing), expected);
                    }
                    4 => {
                        if !queue.is_empty() {
                            history.insert(0, queue.remove(0));
                        }
                        q.song_complete();
                    }
                    _ => {
                        if !history.is_empty() {
                            queue.insert(0, history.remove(0));
                        }
                        q.play_last_song();
                    }
                }
                assert_eq!(q.len(), queue.len(), "seed {seed}");
                assert_eq!(ids(&q.get_queue()), queue, "seed {seed}");
                assert_eq!(ids(&q.get_history(usize::MAX)), history, "seed {seed}");
            }
        }
    }

    #[test]
    fn concurrent_callers_keep_counts_consistent() {
        let q = Arc::new(Queue::new());
        let notified = Arc::new(AtomicUsize::new(0));
        let seen = notified.clone();
        q.add_queue_changed_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let workers: Vec<_> = (0..8)
            .map(|w| {
                let q = q.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        q.add_songs(&[track(&format!("w{w}-{i}"), 2)]);
                    }
                    for _ in 0..10 {
                        q.song_complete();
                        let _ = q.reorder(2, Direction::Later, true);
                        let _ = q.get_queue();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(q.len(), 8 * 40);
        assert_eq!(q.get_history(usize::MAX).len(), 8 * 10);
        assert_eq!(q.total_duration(), 8 * 40 * 2);
        let mut all: Vec<String> = ids(&q.get_queue());
        all.extend(ids(&q.get_history(usize::MAX)));
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 8 * 50);
        // 400 adds, 80 completions, every successful swap.
        assert!(notified.load(Ordering::SeqCst) >= 8 * 60);
    }
}
