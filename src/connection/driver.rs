use std::{future::poll_fn, sync::Arc};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, ReadHalf},
    time::{sleep_until, Instant},
};
use tracing::trace;

use super::{Shared, State};
use crate::transport::BoxTransport;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// What the driver waits on in one loop iteration, computed under the connection lock.
struct Interest {
    closed: bool,
    reading: bool,
    writing: bool,
    deadline: Option<Instant>,
}

impl Shared {
    fn interest(&self) -> Interest {
        let inner = self.inner.lock();
        Interest {
            closed: inner.state >= State::Closed,
            reading: self.is_reading(&inner),
            writing: inner.writer.is_some() && (!inner.queue.is_empty() || inner.needs_flush),
            deadline: self.next_deadline(&inner),
        }
    }
}

/// Drives a connection until it is closed, then waits for in-flight dispatches before marking it
/// finished.
pub(super) async fn run(shared: Arc<Shared>, mut reader: ReadHalf<BoxTransport>) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut backlog = false;

    loop {
        let interest = shared.interest();
        if interest.closed {
            break;
        }
        if backlog && interest.reading {
            backlog = shared.process_input(&mut buf);
            continue;
        }
        if buf.capacity() - buf.len() < READ_BUFFER_SIZE / 2 {
            buf.reserve(READ_BUFFER_SIZE);
        }

        tokio::select! {
            biased;
            _ = shared.wake.notified() => {}
            _ = poll_fn(|cx| shared.poll_write_queue(cx)), if interest.writing => {}
            res = reader.read_buf(&mut buf), if interest.reading && !backlog => match res {
                Ok(0) => shared.on_eof(),
                Ok(_) => backlog = shared.process_input(&mut buf),
                Err(err) => shared.fail(err.into()),
            },
            _ = sleep_until(interest.deadline.unwrap_or_else(Instant::now)), if interest.deadline.is_some() => {
                shared.on_timer(Instant::now());
            }
        }
    }

    drop(reader);
    trace!(connection = shared.id, "driver stopped reading");

    loop {
        let notified = shared.wake.notified();
        if shared.upcalls() == 0 {
            break;
        }
        notified.await;
    }

    let mut inner = shared.inner.lock();
    shared.set_state(&mut inner, State::Finished);
    shared.release(inner);
}
