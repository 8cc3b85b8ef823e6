//! 🪣 BulkQueue: a byte-budgeted, count-budgeted NDJSON buffer.
//!
//! The `_bulk` API has two ceilings, request size and item count. The queue keeps its buffer
//! under both at all times, so whatever `pop_all` hands back is always one valid request.

use thiserror::Error;

/// 🍕 500 operations per bulk request. Elastic says "a few thousand", we say "let's not".
pub const DEFAULT_COUNT_THRESHOLD: usize = 500;
/// 📦 5 MiB per request.
pub const DEFAULT_SIZE_THRESHOLD: usize = 5 * 1024 * 1024;

/// 💀 Somebody called `add` without asking `will_fit` first.
#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "💀 Bulk queue overflow: adding {added_bytes} bytes would make {operation_count} operations \
     and {buffer_size} bytes, past the limits of {count_threshold} operations / {size_threshold} bytes"
)]
pub struct QueueOverflow {
    pub added_bytes: usize,
    pub operation_count: usize,
    pub buffer_size: usize,
    pub count_threshold: usize,
    pub size_threshold: usize,
}

/// 📊 Snapshot of what is sitting in the queue right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub operation_count: usize,
    pub buffer_size: usize,
}

#[derive(Debug)]
pub struct BulkQueue {
    count_threshold: usize,
    size_threshold: usize,
    operation_count: usize,
    buffer: String,
}

impl Default for BulkQueue {
    fn default() -> Self {
        Self::new(DEFAULT_COUNT_THRESHOLD, DEFAULT_SIZE_THRESHOLD)
    }
}

impl BulkQueue {
    pub fn new(count_threshold: usize, size_threshold: usize) -> Self {
        Self {
            count_threshold,
            size_threshold,
            operation_count: 0,
            buffer: String::new(),
        }
    }

    /// 🎯 Would this operation (plus optional payload) still fit in one request?
    pub fn will_fit(&self, operation: &str, payload: Option<&str>) -> bool {
        let added = Self::encoded_len(operation, payload);
        self.operation_count < self.count_threshold
            && self.buffer.len() + added <= self.size_threshold
    }

    /// 🐘 Could this operation fit even after a flush? `false` means no request can ever carry it.
    pub fn fits_in_empty_queue(&self, operation: &str, payload: Option<&str>) -> bool {
        self.count_threshold > 0 && Self::encoded_len(operation, payload) <= self.size_threshold
    }

    /// 📥 Append an operation line and its optional payload line.
    pub fn add(&mut self, operation: &str, payload: Option<&str>) -> Result<(), QueueOverflow> {
        if !self.will_fit(operation, payload) {
            return Err(QueueOverflow {
                added_bytes: Self::encoded_len(operation, payload),
                operation_count: self.operation_count + 1,
                buffer_size: self.buffer.len() + Self::encoded_len(operation, payload),
                count_threshold: self.count_threshold,
                size_threshold: self.size_threshold,
            });
        }

        self.buffer.push_str(operation);
        self.buffer.push('\n');
        if let Some(payload) = payload {
            self.buffer.push_str(payload);
            self.buffer.push('\n');
        }
        self.operation_count += 1;
        Ok(())
    }

    /// 🗑️ Take everything and start over. The only way out of the queue.
    pub fn pop_all(&mut self) -> String {
        self.operation_count = 0;
        std::mem::take(&mut self.buffer)
    }

    pub fn current_stats(&self) -> QueueStats {
        QueueStats {
            operation_count: self.operation_count,
            buffer_size: self.buffer.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operation_count == 0
    }

    // newline terminators count, they go over the wire too
    fn encoded_len(operation: &str, payload: Option<&str>) -> usize {
        operation.len() + 1 + payload.map(|p| p.len() + 1).unwrap_or(0)
    }
}
