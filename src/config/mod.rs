mod loader;
mod schema;

pub use loader::{load_agent_config, load_server_config, validate_agent, validate_server};
pub use schema::{AgentConfig, ServerConfig};
