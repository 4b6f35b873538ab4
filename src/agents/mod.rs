//! 角色：静态注册表与生成 / 投递协作方

pub mod collaborators;
pub mod registry;

pub use collaborators::{Deliverer, Generator, HttpDeliverer, HttpGenerator, LlmGenerator, LogDeliverer};
pub use registry::{AgentDefinition, AgentId, AgentRegistry};
