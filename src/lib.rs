//! Parley - 多角色对话编排服务
//!
//! 模块划分：
//! - **agents**: 静态角色注册表与生成 / 投递协作方
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、服务上下文装配、优雅关闭
//! - **knowledge**: 站点爬取、分块、语义索引与检索
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）、嵌入
//! - **orchestrator**: 轮转发言状态机
//! - **scheduler**: 自动开场与周期爬取
//! - **server**: HTTP 接口
//! - **store**: 连接器、会话/轮次记录、爬取检查点

pub mod agents;
pub mod config;
pub mod core;
pub mod knowledge;
pub mod llm;
pub mod observability;
pub mod orchestrator;
pub mod scheduler;
pub mod server;
pub mod store;

pub use crate::core::{ServiceContext, ServiceContextBuilder};
pub use orchestrator::{OrchestrateRequest, OrchestrateResponse, Orchestrator};
