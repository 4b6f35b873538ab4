//! 文本分块：固定大小、带重叠的字符窗口（UTF-8 安全）
//!
//! 窗口末尾 1/5 范围内若有空白则在空白处断开，避免截断单词；重叠部分保留跨块的局部上下文。

/// 分块参数（字符数）
#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

/// 文档分块器
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        let chunk_size = config.chunk_size.max(1);
        // 重叠必须小于窗口，否则无法前进
        let chunk_overlap = config.chunk_overlap.min(chunk_size - 1);
        Self {
            config: ChunkingConfig {
                chunk_size,
                chunk_overlap,
            },
        }
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    /// 切分文本；返回的下标即 chunk_index
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < total {
            let hard_end = (start + self.config.chunk_size).min(total);
            let mut end = hard_end;

            if hard_end < total {
                let min_end = start + self.config.chunk_size * 4 / 5;
                if let Some(pos) = (min_end.max(start + 1)..hard_end)
                    .rev()
                    .find(|&i| chars[i].is_whitespace())
                {
                    end = pos;
                }
            }

            let piece: String = chars[start..end].iter().collect();
            let piece = piece.trim();
            if !piece.is_empty() {
                chunks.push(piece.to_string());
            }

            if end >= total {
                break;
            }
            let next = end.saturating_sub(self.config.chunk_overlap);
            start = if next > start { next } else { end };
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 100,
            chunk_overlap: 10,
        });
        assert_eq!(chunker.chunk("  hello world  "), vec!["hello world".to_string()]);
        assert!(chunker.chunk("").is_empty());
    }

    #[test]
    fn test_windows_overlap_and_respect_size() {
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 20,
            chunk_overlap: 5,
        });
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu";
        let chunks = chunker.chunk(text);

        assert!(chunks.len() > 2);
        for c in &chunks {
            assert!(c.chars().count() <= 20, "chunk too long: {c:?}");
        }
        // 相邻块之间有重叠内容
        for pair in chunks.windows(2) {
            let tail: String = pair[0].chars().rev().take(3).collect::<Vec<_>>().into_iter().rev().collect();
            assert!(pair[1].contains(tail.trim()) || tail.trim().is_empty());
        }
        assert!(chunks.last().unwrap().ends_with("mu"));
    }

    #[test]
    fn test_multibyte_text() {
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 4,
            chunk_overlap: 1,
        });
        let chunks = chunker.chunk("知识库爬取与检索");
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
        assert_eq!(chunks[0], "知识库爬");
    }

    #[test]
    fn test_overlap_clamped() {
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 3,
            chunk_overlap: 10,
        });
        assert_eq!(chunker.config().chunk_overlap, 2);
        // 不会死循环
        assert!(!chunker.chunk("abcdefghij").is_empty());
    }
}
