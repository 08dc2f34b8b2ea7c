//! Messaging domain: threads, messages, and the service that persists them.
//!
//! A thread is the canonical conversation between exactly two users; its id
//! is derived from the participant pair, so storing a message between the
//! same pair always lands in the same thread regardless of send direction.

mod models;
mod repository;
mod service;
mod thread_id;

pub use models::{Inbox, Message, Thread};
pub use repository::MessagingRepository;
pub use service::MessagingService;
pub use thread_id::derive_thread_id;
