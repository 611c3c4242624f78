pub mod conversations;
pub mod error;
pub mod friends;
pub mod messages;
pub mod middleware;
pub mod settings;
pub mod state;
