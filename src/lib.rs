pub mod codec;
pub mod message;
pub mod proxy;
pub mod queue;
pub mod router;
pub mod upstream;

/// Largest value body accepted for a storage command.
pub const MAX_ITEM_SIZE: usize = 1 << 20;

/// Largest key accepted on the wire.
pub const MAX_KEY_SIZE: usize = 250;
