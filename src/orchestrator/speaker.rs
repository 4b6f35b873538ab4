//! 发言者选择
//!
//! 优先级：刚提交消息中提及的角色（不含该消息的发言者）→ 首个角色轮次用指定发起者 →
//! 在除上一位角色发言者之外的角色中均匀随机；只注册一个角色时允许重复。

use rand::seq::SliceRandom;
use rand::Rng;

use crate::agents::{AgentId, AgentRegistry};

/// 选择时需要的会话状态
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeakerContext<'a> {
    /// 刚提交的消息
    pub last_text: &'a str,
    /// 刚提交消息的发言角色（用户消息为 None）
    pub last_speaker: Option<AgentId>,
    /// 最近一次角色轮次的发言者
    pub previous_agent: Option<AgentId>,
    pub initiator: Option<AgentId>,
    /// 会话中还没有任何角色轮次
    pub first_agent_turn: bool,
}

pub fn select_speaker<R: Rng + ?Sized>(
    registry: &AgentRegistry,
    ctx: &SpeakerContext<'_>,
    rng: &mut R,
) -> Option<AgentId> {
    if let Some(mentioned) = registry.find_mentioned(ctx.last_text, ctx.last_speaker) {
        return Some(mentioned);
    }
    if ctx.first_agent_turn {
        if let Some(initiator) = ctx.initiator.filter(|id| registry.get(*id).is_some()) {
            return Some(initiator);
        }
    }

    let all: Vec<AgentId> = registry.ids().collect();
    let candidates: Vec<AgentId> = all
        .iter()
        .copied()
        .filter(|id| Some(*id) != ctx.previous_agent)
        .collect();
    if candidates.is_empty() {
        all.choose(rng).copied()
    } else {
        candidates.choose(rng).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentSection;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn registry(names: &[&str]) -> AgentRegistry {
        let sections: Vec<AgentSection> = names
            .iter()
            .map(|n| AgentSection {
                name: n.to_string(),
                mention_handle: None,
                generation_endpoint: String::new(),
                delivery_endpoint: String::new(),
            })
            .collect();
        AgentRegistry::from_config(&sections).unwrap()
    }

    #[test]
    fn test_never_repeats_previous_and_is_roughly_uniform() {
        let registry = registry(&["A", "B", "C"]);
        let mut rng = StdRng::seed_from_u64(7);
        let ctx = SpeakerContext {
            last_text: "no mention here",
            last_speaker: Some(AgentId(0)),
            previous_agent: Some(AgentId(0)),
            ..Default::default()
        };

        let mut counts = [0usize; 3];
        for _ in 0..3000 {
            let id = select_speaker(&registry, &ctx, &mut rng).unwrap();
            counts[id.0] += 1;
        }
        assert_eq!(counts[0], 0);
        assert!(counts[1] > 1300 && counts[2] > 1300, "skewed: {:?}", counts);
    }

    #[test]
    fn test_mention_wins_over_initiator() {
        let registry = registry(&["A", "B", "C"]);
        let mut rng = StdRng::seed_from_u64(1);
        let ctx = SpeakerContext {
            last_text: "hey @c what's up",
            initiator: Some(AgentId(1)),
            first_agent_turn: true,
            ..Default::default()
        };
        assert_eq!(select_speaker(&registry, &ctx, &mut rng), Some(AgentId(2)));
    }

    #[test]
    fn test_self_mention_ignored() {
        let registry = registry(&["A", "B"]);
        let mut rng = StdRng::seed_from_u64(3);
        let ctx = SpeakerContext {
            last_text: "as @A I think",
            last_speaker: Some(AgentId(0)),
            previous_agent: Some(AgentId(0)),
            ..Default::default()
        };
        assert_eq!(select_speaker(&registry, &ctx, &mut rng), Some(AgentId(1)));
    }

    #[test]
    fn test_initiator_on_first_agent_turn() {
        let registry = registry(&["A", "B", "C"]);
        let mut rng = StdRng::seed_from_u64(5);
        let ctx = SpeakerContext {
            last_text: "hello",
            initiator: Some(AgentId(2)),
            first_agent_turn: true,
            ..Default::default()
        };
        assert_eq!(select_speaker(&registry, &ctx, &mut rng), Some(AgentId(2)));
    }

    #[test]
    fn test_single_agent_may_repeat() {
        let registry = registry(&["Solo"]);
        let mut rng = StdRng::seed_from_u64(9);
        let ctx = SpeakerContext {
            last_text: "again",
            last_speaker: Some(AgentId(0)),
            previous_agent: Some(AgentId(0)),
            ..Default::default()
        };
        assert_eq!(select_speaker(&registry, &ctx, &mut rng), Some(AgentId(0)));
        assert_eq!(select_speaker(&AgentRegistry::default(), &ctx, &mut rng), None);
    }
}
