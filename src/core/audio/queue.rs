use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::segment::AudioSegment;

/// FIFO of inbound segments, shared by the transport (producer) and the
/// playback pipeline or a caller-supplied processor (consumers).
///
/// Every operation takes the lock once, so a segment is handed out at most
/// once and order is preserved under concurrent append and drain.
#[derive(Debug, Clone, Default)]
pub struct AudioQueue {
    segments: Arc<Mutex<VecDeque<AudioSegment>>>,
}

impl AudioQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, segment: AudioSegment) {
        self.segments.lock().push_back(segment);
    }

    /// Put an interrupted segment back at the head.
    pub(crate) fn push_front(&self, segment: AudioSegment) {
        self.segments.lock().push_front(segment);
    }

    pub fn pop(&self) -> Option<AudioSegment> {
        self.segments.lock().pop_front()
    }

    /// Remove every queued segment at once.
    pub fn drain(&self) -> Vec<AudioSegment> {
        self.segments.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.segments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.lock().is_empty()
    }

    /// Discard every queued segment, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut segments = self.segments.lock();
        let dropped = segments.len();
        segments.clear();
        dropped
    }

    /// Copy of the queued segments, in order.
    pub fn snapshot(&self) -> Vec<AudioSegment> {
        self.segments.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(n: u32) -> AudioSegment {
        AudioSegment {
            text: format!("sentence {n}"),
            audio_data: String::new(),
            sample_rate: 24000,
            segment_id: format!("seg-{n}"),
            sentence_number: n,
            generation_time_ms: 0.0,
            format: "pcm_f32le".to_string(),
            duration_seconds: 0.0,
        }
    }

    #[test]
    fn test_fifo_by_arrival_not_sentence_number() {
        let queue = AudioQueue::new();
        queue.push(seg(2));
        queue.push(seg(1));
        queue.push(seg(3));

        let order: Vec<u32> = std::iter::from_fn(|| queue.pop())
            .map(|s| s.sentence_number)
            .collect();
        assert_eq!(order, vec![2, 1, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_front() {
        let queue = AudioQueue::new();
        queue.push(seg(2));
        queue.push_front(seg(1));
        assert_eq!(queue.pop().unwrap().sentence_number, 1);
    }

    #[test]
    fn test_clear_and_len() {
        let queue = AudioQueue::new();
        assert_eq!(queue.clear(), 0);
        for n in 0..5 {
            queue.push(seg(n));
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.clear(), 5);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_drain_takes_everything_in_order() {
        let queue = AudioQueue::new();
        for n in [2, 1, 3] {
            queue.push(seg(n));
        }

        let drained: Vec<u32> = queue.drain().iter().map(|s| s.sentence_number).collect();
        assert_eq!(drained, vec![2, 1, 3]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_snapshot_does_not_consume() {
        let queue = AudioQueue::new();
        queue.push(seg(1));
        queue.push(seg(2));
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_concurrent_push_and_pop_lose_nothing() {
        let queue = AudioQueue::new();
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for n in 0..1000 {
                    queue.push(seg(n));
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 1000 {
            if let Some(s) = queue.pop() {
                seen.push(s.sentence_number);
            }
        }
        producer.join().unwrap();

        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }
}
