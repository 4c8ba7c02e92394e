//! Streaming content assembly.
//!
//! A [`Clob`] is an append-only buffer with two states, OPEN and CLOSED.
//! While OPEN a single producer appends chunks and readers observe them
//! as they arrive. Once closed the content is immutable and fully
//! materialized; both the blocking full read and the incremental reader
//! then replay deterministically without the producer.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::error::WireError;

/// Lazily-assembled message content.
///
/// Clones share the same underlying buffer, so a clob handed to many
/// subscribers keeps filling in for all of them as the producer appends.
#[derive(Clone, Debug, Default)]
pub struct Clob {
    inner: Arc<ClobInner>,
}

#[derive(Debug, Default)]
struct ClobInner {
    state: Mutex<ClobState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct ClobState {
    chunks: Vec<String>,
    closed: bool,
}

impl Clob {
    /// A new, empty buffer in the OPEN state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one chunk. Only valid while OPEN.
    pub async fn append(&self, chunk: impl Into<String>) -> Result<(), WireError> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(WireError::ClobClosed);
        }
        state.chunks.push(chunk.into());
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Transition OPEN -> CLOSED. Idempotent.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    /// The full content, waiting until the buffer is CLOSED if needed.
    pub async fn get_content(&self) -> String {
        loop {
            let notified = self.inner.notify.notified();
            {
                let state = self.inner.state.lock().await;
                if state.closed {
                    return state.chunks.concat();
                }
            }
            notified.await;
        }
    }

    /// An incremental reader over the chunks, yielding each as it
    /// arrives and ending once the buffer is closed and drained.
    ///
    /// Each reader traverses independently, but the supported contract
    /// while the buffer is still OPEN is a single traversal; after
    /// `close` any number of readers replay the same content.
    pub fn reader(&self) -> ClobReader {
        ClobReader {
            clob: self.clone(),
            next: 0,
        }
    }
}

/// Single-pass cursor over a [`Clob`]'s chunks.
#[derive(Debug)]
pub struct ClobReader {
    clob: Clob,
    next: usize,
}

impl ClobReader {
    /// The next chunk, waiting for the producer while the buffer is
    /// OPEN. Returns `None` once the buffer is closed and fully read.
    pub async fn next_chunk(&mut self) -> Option<String> {
        loop {
            let notified = self.clob.inner.notify.notified();
            {
                let state = self.clob.inner.state.lock().await;
                if self.next < state.chunks.len() {
                    let chunk = state.chunks[self.next].clone();
                    self.next += 1;
                    return Some(chunk);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}
