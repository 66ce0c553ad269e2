//! Bounded FIFO pool of pipeline handles.
//!
//! One multiplexed connection to the backing server is shared by every
//! handle; each handle owns a command buffer that accumulates operations
//! and flushes them on [`PooledPipeline::execute`]. All writes in the crate
//! go through the pool so a saturated element (command loop + publisher +
//! reader in parallel) queues fairly instead of starving itself.
//!
//! Handles return to the pool on drop, on every exit path.

use redis::aio::MultiplexedConnection;
use redis::FromRedisValue;
use tokio::sync::{mpsc, Mutex};

use crate::error::Result;

pub struct PipelinePool {
    conn: MultiplexedConnection,
    slots_tx: mpsc::Sender<redis::Pipeline>,
    slots_rx: Mutex<mpsc::Receiver<redis::Pipeline>>,
}

impl PipelinePool {
    pub fn new(conn: MultiplexedConnection, size: usize) -> Self {
        let (slots_tx, slots_rx) = mpsc::channel(size);
        for _ in 0..size {
            // Capacity equals the handle count; these sends cannot fail.
            let _ = slots_tx.try_send(redis::pipe());
        }
        PipelinePool {
            conn,
            slots_tx,
            slots_rx: Mutex::new(slots_rx),
        }
    }

    /// Wait for a free pipeline handle. FIFO across waiting tasks.
    pub async fn acquire(&self) -> PooledPipeline {
        let pipe = {
            let mut rx = self.slots_rx.lock().await;
            // The pool holds its own sender, so the channel never closes.
            rx.recv().await.unwrap_or_else(redis::pipe)
        };
        PooledPipeline {
            pipe: Some(pipe),
            conn: self.conn.clone(),
            slots_tx: self.slots_tx.clone(),
        }
    }
}

/// An acquired handle. Build up commands with [`pipeline`](Self::pipeline),
/// flush with [`execute`](Self::execute); the handle goes back to the pool
/// when dropped.
pub struct PooledPipeline {
    pipe: Option<redis::Pipeline>,
    conn: MultiplexedConnection,
    slots_tx: mpsc::Sender<redis::Pipeline>,
}

impl PooledPipeline {
    pub fn pipeline(&mut self) -> &mut redis::Pipeline {
        // Always Some until drop.
        self.pipe.get_or_insert_with(redis::pipe)
    }

    /// Flush the buffered commands and parse their replies. The buffer is
    /// cleared whether or not the round trip succeeds, so a handle is
    /// always reusable afterwards.
    pub async fn execute<T: FromRedisValue>(&mut self) -> Result<T> {
        let pipe = self.pipe.get_or_insert_with(redis::pipe);
        let result = pipe.query_async(&mut self.conn).await;
        pipe.clear();
        Ok(result?)
    }
}

impl Drop for PooledPipeline {
    fn drop(&mut self) {
        if let Some(mut pipe) = self.pipe.take() {
            pipe.clear();
            // Capacity equals the handle count; this send cannot fail.
            let _ = self.slots_tx.try_send(pipe);
        }
    }
}
