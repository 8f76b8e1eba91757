//! Content-generation and semantic-search collaborators.
//!
//! The real LLM and vector-database backends live outside this repository;
//! this crate pins down their contracts and ships deterministic in-process
//! implementations good enough to run the whole pipeline locally and under
//! test. It also owns the document corpus: the text rendition of tracker
//! events that the vector index is kept aligned with.

pub mod docs;
pub mod embed;
pub mod llm;
pub mod vector;

use oscar_core::error::BoxedError;
use oscar_db::DbError;
use snafu::{Location, Snafu};

pub use self::docs::{DOCS, Document, DocsSync, VectorSync};
pub use self::embed::{EMBEDDING_DIM, Embedder, HashEmbedder};
pub use self::llm::{Generator, ScriptedGenerator, generate_json};
pub use self::vector::{MemoryVectorDb, VectorDb, VectorResult};

const LOG_TARGET: &str = "oscar::ai";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AiError {
    #[snafu(display("generation backend failure: {source}"))]
    Backend { source: BoxedError },
    #[snafu(display("generation produced unusable JSON: {source}"))]
    BadJson {
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("scripted generator ran out of responses"))]
    Exhausted,
    #[snafu(transparent)]
    Db {
        source: DbError,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type AiResult<T> = std::result::Result<T, AiError>;
