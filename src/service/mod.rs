pub mod chat_service;
pub mod persistence;
pub mod thread_lifecycle;
