//! 角色注册表：启动时由配置一次性构建，之后只读
//!
//! 角色以稳定的 `AgentId`（注册顺序下标）寻址；名称匹配不区分大小写。

use serde::Serialize;

use crate::config::AgentSection;
use crate::core::OrchestrationError;

/// 注册表中的稳定下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AgentId(pub usize);

/// 一个模拟角色
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentDefinition {
    pub id: AgentId,
    pub name: String,
    /// 频道中的提及方式，缺省为 `@name`
    pub mention_handle: String,
    pub generation_endpoint: String,
    pub delivery_endpoint: String,
}

impl AgentDefinition {
    /// 在文本中最早被提及的位置（mention handle 或 `@name`）
    pub fn mention_position(&self, text: &str) -> Option<usize> {
        let lower = text.to_lowercase();
        let by_name = format!("@{}", self.name.to_lowercase());
        [self.mention_handle.to_lowercase(), by_name]
            .iter()
            .filter(|needle| !needle.is_empty())
            .filter_map(|needle| find_token(&lower, needle))
            .min()
    }
}

/// 查找 needle，要求其后不是名称字符（避免 `@Ada` 命中 `@Adam`）
fn find_token(haystack: &str, needle: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        let start = from + pos;
        let end = start + needle.len();
        let boundary = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '_'));
        if boundary {
            return Some(start);
        }
        from = start + needle.chars().next().map_or(1, char::len_utf8);
    }
    None
}

#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<AgentDefinition>,
}

impl AgentRegistry {
    pub fn from_config(sections: &[AgentSection]) -> Result<Self, OrchestrationError> {
        let mut agents: Vec<AgentDefinition> = Vec::with_capacity(sections.len());
        for section in sections {
            let name = section.name.trim();
            if name.is_empty() {
                return Err(OrchestrationError::InvalidRequest(
                    "agent name must not be empty".to_string(),
                ));
            }
            if agents.iter().any(|a| a.name.eq_ignore_ascii_case(name)) {
                return Err(OrchestrationError::InvalidRequest(format!(
                    "duplicate agent name '{}'",
                    name
                )));
            }
            let mention_handle = section
                .mention_handle
                .as_deref()
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("@{}", name));
            agents.push(AgentDefinition {
                id: AgentId(agents.len()),
                name: name.to_string(),
                mention_handle,
                generation_endpoint: section.generation_endpoint.clone(),
                delivery_endpoint: section.delivery_endpoint.clone(),
            });
        }
        Ok(Self { agents })
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.agents.iter().map(|a| a.id)
    }

    pub fn get(&self, id: AgentId) -> Option<&AgentDefinition> {
        self.agents.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.iter()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&AgentDefinition> {
        let name = name.trim();
        self.agents.iter().find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn find_by_mention(&self, handle: &str) -> Option<&AgentDefinition> {
        let handle = handle.trim();
        self.agents
            .iter()
            .find(|a| a.mention_handle.eq_ignore_ascii_case(handle))
    }

    /// 文本中最早被提及的角色，排除发言者本人
    pub fn find_mentioned(&self, text: &str, exclude: Option<AgentId>) -> Option<AgentId> {
        self.agents
            .iter()
            .filter(|a| Some(a.id) != exclude)
            .filter_map(|a| a.mention_position(text).map(|pos| (pos, a.id)))
            .min()
            .map(|(_, id)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(name: &str, mention: Option<&str>) -> AgentSection {
        AgentSection {
            name: name.to_string(),
            mention_handle: mention.map(str::to_string),
            generation_endpoint: format!("http://gen/{}", name),
            delivery_endpoint: format!("http://relay/{}", name),
        }
    }

    #[test]
    fn test_from_config_assigns_ids_and_default_handles() {
        let registry =
            AgentRegistry::from_config(&[section("Ada", None), section("Grace", Some("<@42>"))]).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(AgentId(0)).unwrap().mention_handle, "@Ada");
        assert_eq!(registry.find_by_name("grace").unwrap().id, AgentId(1));
        assert_eq!(registry.find_by_mention("<@42>").unwrap().name, "Grace");
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = AgentRegistry::from_config(&[section("Ada", None), section("ada", None)]).unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidRequest(_)));
    }

    #[test]
    fn test_find_mentioned_earliest_excluding_speaker() {
        let registry = AgentRegistry::from_config(&[
            section("Ada", None),
            section("Grace", Some("<@42>")),
            section("Linus", None),
        ])
        .unwrap();

        assert_eq!(
            registry.find_mentioned("what do you think <@42>, and @linus?", None),
            Some(AgentId(1))
        );
        assert_eq!(
            registry.find_mentioned("what do you think <@42>, and @linus?", Some(AgentId(1))),
            Some(AgentId(2))
        );
        assert_eq!(registry.find_mentioned("no mention here", None), None);
        // 前缀相同的名字不算提及
        assert_eq!(registry.find_mentioned("ping @Adam please", None), None);
    }
}
