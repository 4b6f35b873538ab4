//! 知识库：站点爬取、分块、语义索引与检索

pub mod chunker;
pub mod crawler;
pub mod html;
pub mod index;
pub mod retriever;

pub use chunker::{Chunker, ChunkingConfig};
pub use crawler::{CrawlParams, CrawlPermit, CrawlReport, Crawler, HttpFetcher, PageFetcher};
pub use index::{cosine_similarity, DocumentChunk, ScoredChunk, SemanticIndex, SqliteIndex};
pub use retriever::Retriever;
