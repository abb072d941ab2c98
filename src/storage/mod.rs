//! Storage module
//!
//! Key/value backends for persisted client state, the typed state layer on
//! top of them, and in-memory piece bookkeeping.

pub mod backend;
pub mod cache;
pub mod file;
pub mod memory;
pub mod piece;
pub mod state;

pub use backend::{KeyValueStore, Namespaced};
pub use cache::CachedStore;
pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use piece::{sha1_digest, Piece, PieceAssembly, PieceTable, BLOCK_SIZE};
pub use state::StateStore;
