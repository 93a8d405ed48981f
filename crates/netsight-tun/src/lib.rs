pub mod app;
pub mod builder;
pub mod cache;
pub mod context;
pub mod device;
pub mod encryption;
pub mod engine;
pub mod packet;
pub mod process;
pub mod transport;

pub use engine::{ComponentManager, EngineError, EngineServices};
