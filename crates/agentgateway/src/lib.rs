pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod llm;
pub mod prompt;
pub mod proxy;
pub mod router;
pub mod telemetry;
pub mod types;

pub mod prelude {
	pub use agent_core::prelude::*;
}
