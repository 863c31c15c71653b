//! Background prefetching over a bounded queue.

use crossbeam_channel::{bounded, Receiver};
use std::thread::{self, JoinHandle};

/// Runs an iterator on a producer thread, at most `depth` items ahead of the consumer.
///
/// Items come out in exactly the order the inner iterator yields them. Dropping
/// the prefetcher disconnects the queue and joins the producer.
pub struct Prefetcher<T> {
    rx: Option<Receiver<T>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Prefetcher<T> {
    pub fn spawn<I>(iter: I, depth: usize) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let (tx, rx) = bounded(depth.max(1));
        let iter = iter.into_iter();
        let handle = thread::spawn(move || {
            for item in iter {
                if tx.send(item).is_err() {
                    break;
                }
            }
        });
        Self {
            rx: Some(rx),
            handle: Some(handle),
        }
    }
}

impl<T> Prefetcher<T> {
    /// Items produced but not yet consumed.
    pub fn queued(&self) -> usize {
        self.rx.as_ref().map_or(0, Receiver::len)
    }

    fn finish(&mut self) {
        self.rx = None;
        if let Some(handle) = self.handle.take() {
            if let Err(panic) = handle.join() {
                // re-raise producer panics on the consumer
                std::panic::resume_unwind(panic);
            }
        }
    }
}

impl<T> Iterator for Prefetcher<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let rx = self.rx.as_ref()?;
        match rx.recv() {
            Ok(item) => Some(item),
            Err(_) => {
                self.finish();
                None
            }
        }
    }
}

impl<T> Drop for Prefetcher<T> {
    fn drop(&mut self) {
        self.rx = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("prefetch producer panicked");
            }
        }
    }
}
