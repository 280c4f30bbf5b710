pub mod block_core;
pub mod block_error;
