use std::mem;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::protocol::{BATCH_COUNT_LEN, HEADER_SIZE};

/// One-way request bodies waiting to be sent together as a single batch frame.
pub(crate) struct BatchRequestQueue {
    state: Mutex<BatchState>,
    auto_flush_size: Option<usize>,
}

#[derive(Default)]
struct BatchState {
    requests: Vec<Bytes>,
    compress: bool,
    /// Size of the batch frame the queued requests would make
    frame_size: usize,
}

/// Requests taken out of the queue, ready to be framed.
pub(crate) struct Batch {
    pub(crate) requests: Vec<Bytes>,
    pub(crate) compress: bool,
}

impl BatchRequestQueue {
    pub(crate) fn new(auto_flush_size: Option<usize>) -> Self {
        BatchRequestQueue {
            state: Mutex::new(BatchState {
                frame_size: HEADER_SIZE + BATCH_COUNT_LEN,
                ..BatchState::default()
            }),
            auto_flush_size,
        }
    }

    /// Queues a request body.
    ///
    /// When adding it would grow the batch frame past the auto flush size, the requests queued so
    /// far are returned for flushing and `body` starts the next batch.
    pub(crate) fn push(&self, body: Bytes, compress: bool) -> Option<Batch> {
        let mut state = self.state.lock();
        let added = 4 + body.len();

        let flushed = match self.auto_flush_size {
            Some(limit) if !state.requests.is_empty() && state.frame_size + added > limit => {
                Some(Self::take_locked(&mut state))
            }
            _ => None,
        };

        state.frame_size += added;
        state.compress |= compress;
        state.requests.push(body);
        flushed
    }

    /// Takes every queued request.
    pub(crate) fn take(&self) -> Option<Batch> {
        let mut state = self.state.lock();
        if state.requests.is_empty() {
            return None;
        }
        Some(Self::take_locked(&mut state))
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().requests.len()
    }

    fn take_locked(state: &mut BatchState) -> Batch {
        state.frame_size = HEADER_SIZE + BATCH_COUNT_LEN;
        Batch {
            requests: mem::take(&mut state.requests),
            compress: mem::take(&mut state.compress),
        }
    }
}
