pub mod conversation_service;
pub mod key_manager;
pub mod locks;
pub mod notification_dispatcher;
pub mod rate_limiter;
pub mod retention;
