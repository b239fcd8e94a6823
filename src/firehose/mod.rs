//! Commit stream: frames, typed records, classification and the consumer loop.

/// Commit to typed-operation classification.
pub mod classify;
/// Subscription loop and cursor checkpointing.
pub mod consumer;
/// Frame envelope decoding.
pub mod frame;
/// Record bodies.
pub mod records;
/// Transport traits.
pub mod source;
