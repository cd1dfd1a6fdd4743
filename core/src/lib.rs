pub mod discovery;
pub mod network;
pub mod recorder;
pub mod registry;
pub mod shutdown;
pub mod types;
pub mod utils;
