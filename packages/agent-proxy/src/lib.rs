pub mod cli;
pub mod config;
pub mod conversations;
pub mod events;
pub mod normalize;
pub mod providers;
pub mod router;
pub mod stream;
