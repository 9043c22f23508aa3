//! Question answering pipeline: retrieval context, prompt rendering and the
//! two inference drivers.

pub mod checkpoint;
pub mod context;
pub mod orchestrator;
pub mod prompt;

pub use checkpoint::{backup_existing, run_checkpointed, ResultSink};
pub use context::{build_indexes, embedding_provider, load_tokenizer, prepare_items, PreparedItem, RetrievalContext};
pub use orchestrator::{partition, run_partitioned, BatchTask, RunContext, RunPhase, RunSummary};
pub use prompt::PromptTemplate;
