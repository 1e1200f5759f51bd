//! Conversation persistence: the relational index and the
//! content-addressed blob caches.

pub mod cache;
pub mod db;
pub mod expiring;
