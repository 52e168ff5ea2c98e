//! End-to-end scenarios across sessions, cache and queue.
