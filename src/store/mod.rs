//! 持久化层：连接器（重试 + 探活）、会话/轮次记录、爬取检查点

pub mod checkpoint;
pub mod connector;
pub mod conversations;

pub use checkpoint::{CheckpointStore, CrawlCheckpoint, CrawlStatus};
pub use connector::{connect, ConnectOptions, StoreHandles};
pub use conversations::{ConversationSession, ConversationStore, NewTurn, SessionId, Turn, TurnRole};
