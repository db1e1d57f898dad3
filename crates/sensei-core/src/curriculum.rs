//! Static tutoring curriculum and persona texts.

/// A curriculum entry. Defined at compile time, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topic {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub prompt: &'static str,
}

impl Topic {
    /// First user turn sent when a session starts on this topic.
    pub fn seed_prompt(&self) -> String {
        format!(
            "안녕하세요! 저는 오늘 '{}'에 대해 배우고 싶습니다. {}",
            self.title, self.prompt
        )
    }
}

pub const TOPICS: &[Topic] = &[
    Topic {
        id: "intro",
        title: "🐍 파이썬 코딩 기초",
        description: "코딩 테스트를 위한 파이썬 핵심 문법",
        prompt: "코딩 테스트에서 자주 쓰이는 파이썬의 핵심 문법(List Comprehension, Slice, 기본 라이브러리 등)에 대해 알려주세요. 예제 코드는 반드시 Python으로 작성해주세요.",
    },
    Topic {
        id: "array_hash",
        title: "배열과 해시",
        description: "데이터 저장과 빠른 검색",
        prompt: "배열(Array)과 해시(Hash/Dictionary)의 개념과 파이썬에서의 효율적인 사용법, 그리고 Two Sum 같은 대표적인 예제에 대해 설명해주세요.",
    },
    Topic {
        id: "stack_queue",
        title: "스택과 큐",
        description: "LIFO와 FIFO 구조",
        prompt: "스택(Stack)과 큐(Queue)의 개념을 설명하고, 파이썬의 list와 collections.deque를 사용하여 구현하는 방법을 알려주세요.",
    },
    Topic {
        id: "tree",
        title: "트리 구조",
        description: "계층적 데이터와 순회",
        prompt: "트리(Tree) 자료구조의 기본 개념과 이진 트리(Binary Tree)의 순회 방법(전위, 중위, 후위)을 설명하고, 파이썬으로 Node 클래스를 만들어 구현하는 예제를 보여주세요.",
    },
    Topic {
        id: "heap",
        title: "힙과 우선순위 큐",
        description: "최댓값/최솟값 빠르게 찾기",
        prompt: "힙(Heap) 자료구조의 개념과 우선순위 큐의 동작 원리를 설명하고, 파이썬의 heapq 모듈을 사용하여 최소 힙과 최대 힙을 다루는 방법을 알려주세요.",
    },
    Topic {
        id: "dfs_bfs",
        title: "DFS / BFS",
        description: "그래프 탐색의 기초",
        prompt: "깊이 우선 탐색(DFS)과 너비 우선 탐색(BFS)의 차이점과 파이썬 구현 패턴, 그리고 어떤 문제 유형(예: 미로 찾기, 최단 거리)에 쓰이는지 알려주세요.",
    },
    Topic {
        id: "dp",
        title: "다이나믹 프로그래밍",
        description: "복잡한 문제를 나누어 풀기",
        prompt: "동적 계획법(DP)의 핵심 개념(Memoization, Tabulation)과 피보나치 수열을 통한 파이썬 예제를 설명해주세요.",
    },
    Topic {
        id: "greedy",
        title: "그리디 알고리즘",
        description: "현재 최선의 선택",
        prompt: "탐욕 알고리즘(Greedy)의 개념과 파이썬으로 풀 수 있는 대표적인 예제(거스름돈 문제, 회의실 배정 등)를 설명해주세요.",
    },
];

/// Shown when a session starts without a topic.
pub const GREETING: &str = "안녕하세요! 알고선생입니다. 주제 목록(/topics)에서 배우고 싶은 알고리즘 주제를 선택하거나, 궁금한 점을 바로 질문해주세요. 모든 코드는 Python으로 알려드립니다! 🐍";

/// Appended when a topic's opening reply fails.
pub const TOPIC_ERROR: &str = "오류가 발생했습니다. 다시 시도해주세요.";

/// Appended when a reply to user input fails.
pub const SEND_ERROR: &str = "죄송합니다. 오류가 발생했습니다.";

const PERSONA: &str = "당신은 '알고선생(AlgoSensei)'이라는 이름의 친절하고 유능한 알고리즘 튜터입니다.
사용자가 알고리즘 및 자료구조를 쉽게 이해할 수 있도록 도와주세요.

[규칙]
1. **모든 코드 예제는 반드시 Python으로 제공하세요.**
2. 설명은 한국어로 명확하고 이해하기 쉽게 작성하세요.
3. 코드를 제공할 때는 항상 **시간 복잡도(Time Complexity)**와 **공간 복잡도(Space Complexity)** 분석을 포함하세요.
4. 처음에는 개념을 설명하고, 사용자가 이해했는지 확인한 후 예제 코드를 보여주는 방식(소크라테스식 문답법)을 선호하세요.
5. 사용자가 틀린 답을 말하면 부드럽게 교정해주고, 올바른 방향으로 유도하세요.";

/// Build the tutor's system instruction, focused on `topic` when given.
pub fn system_instruction(topic: Option<&Topic>) -> String {
    match topic {
        Some(topic) => format!(
            "{PERSONA}\n\n현재 학습 주제는 '{}'입니다. 이 주제에 집중해서 설명해 주세요.",
            topic.title
        ),
        None => PERSONA.to_string(),
    }
}

/// Look up a topic by id or by its 1-based position in [`TOPICS`].
pub fn find_topic(key: &str) -> Option<&'static Topic> {
    let key = key.trim();
    if let Some(topic) = TOPICS.iter().find(|t| t.id.eq_ignore_ascii_case(key)) {
        return Some(topic);
    }
    key.parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| TOPICS.get(i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_ids_are_unique() {
        let mut ids: Vec<&str> = TOPICS.iter().map(|t| t.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), TOPICS.len());
    }

    #[test]
    fn test_find_topic_by_id_and_index() {
        assert_eq!(find_topic("heap").map(|t| t.id), Some("heap"));
        assert_eq!(find_topic(" DP ").map(|t| t.id), Some("dp"));
        assert_eq!(find_topic("1").map(|t| t.id), Some("intro"));
        assert_eq!(find_topic("8").map(|t| t.id), Some("greedy"));
        assert!(find_topic("0").is_none());
        assert!(find_topic("9").is_none());
        assert!(find_topic("graph").is_none());
    }

    #[test]
    fn test_seed_prompt_mentions_title_and_prompt() {
        let topic = find_topic("stack_queue").unwrap();
        let seed = topic.seed_prompt();
        assert!(seed.starts_with("안녕하세요! 저는 오늘 '스택과 큐'에 대해 배우고 싶습니다."));
        assert!(seed.ends_with(topic.prompt));
    }

    #[test]
    fn test_system_instruction_topic_line() {
        let topic = find_topic("tree").unwrap();
        assert!(system_instruction(Some(topic)).contains("현재 학습 주제는 '트리 구조'입니다."));
        assert!(!system_instruction(None).contains("현재 학습 주제"));
    }
}
