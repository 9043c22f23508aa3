pub mod search;
pub mod status;

pub use search::RetrievePassagesArgs;
pub use status::IndexStatusArgs;

use crate::pipeline::RetrievalContext;
use crate::Config;
use std::sync::Arc;

/// MCP tool handlers over one shared, read-only retrieval context
#[derive(Clone)]
pub struct ToolHandlers {
    config: Config,
    context: Arc<RetrievalContext>,
}

impl ToolHandlers {
    pub fn new(config: Config, context: Arc<RetrievalContext>) -> Self {
        Self { config, context }
    }

    pub fn context(&self) -> &RetrievalContext {
        &self.context
    }
}
