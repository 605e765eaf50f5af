pub mod channel;
pub mod mock_channel;
pub mod monitor;
pub mod service;
pub mod session;
pub mod session_id;
pub mod session_registry;
