mod catalogue;

use crate::models::chat::{ ChatMessage, MessageKind, Participant };
use catalogue::{ Intent, KEYWORDS, REPLIES };
use rand::Rng;
use std::time::Duration;

const FUZZY_MATCH_THRESHOLD: f64 = 0.9;

/// What the simulated peer will say and how long it takes to say it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPlan {
    pub body: String,
    pub typing_duration: Duration,
    pub send_delay: Duration,
}

/// Timing policy for simulated replies. All values in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTiming {
    pub base_typing_ms: u64,
    pub per_char_ms: u64,
    pub typing_jitter_ms: u64,
    pub min_typing_ms: u64,
    pub max_typing_ms: u64,
    pub min_pause_ms: u64,
    pub max_pause_ms: u64,
}

impl Default for ReplyTiming {
    fn default() -> Self {
        Self {
            base_typing_ms: 900,
            per_char_ms: 55,
            typing_jitter_ms: 700,
            min_typing_ms: 1_200,
            max_typing_ms: 8_000,
            min_pause_ms: 500,
            max_pause_ms: 1_500,
        }
    }
}

impl ReplyTiming {
    /// Near-instant timing, for demos and tests that run against a real clock.
    pub fn brisk() -> Self {
        Self {
            base_typing_ms: 20,
            per_char_ms: 1,
            typing_jitter_ms: 10,
            min_typing_ms: 20,
            max_typing_ms: 120,
            min_pause_ms: 10,
            max_pause_ms: 30,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AutoResponder {
    timing: ReplyTiming,
}

impl AutoResponder {
    pub fn new(timing: ReplyTiming) -> Self {
        Self { timing }
    }

    pub fn timing(&self) -> &ReplyTiming {
        &self.timing
    }

    /// Plans the peer's next reply from the conversation so far.
    ///
    /// No I/O happens here; given the same history and the same random source
    /// the plan is identical. `typing_duration` is always strictly shorter than
    /// `send_delay`.
    pub fn plan<R: Rng + ?Sized>(
        &self,
        peer: &Participant,
        history: &[ChatMessage],
        rng: &mut R
    ) -> ReplyPlan {
        let last_human = history
            .iter()
            .rev()
            .find(|m| m.sender_id != peer.user_id);
        let last_peer_body = history
            .iter()
            .rev()
            .find(|m| m.sender_id == peer.user_id)
            .map(|m| m.body.as_str());

        let intent = last_human.map(classify).unwrap_or(Intent::Greeting);
        let replies = REPLIES.get(&intent).copied().unwrap_or(&[]);
        let body = if replies.is_empty() {
            "haha tell me more".to_string()
        } else {
            let name = last_human.map(|m| m.sender_name.as_str()).unwrap_or("there");
            // rotate with the conversation so equal draws still vary
            let index = (rng.random_range(0..replies.len()) + history.len()) % replies.len();
            let body = replies[index].replace("{name}", name);
            if replies.len() > 1 && Some(body.as_str()) == last_peer_body {
                replies[(index + 1) % replies.len()].replace("{name}", name)
            } else {
                body
            }
        };

        let (typing_duration, send_delay) = self.timings_for(&body, rng);
        ReplyPlan { body, typing_duration, send_delay }
    }

    fn timings_for<R: Rng + ?Sized>(&self, body: &str, rng: &mut R) -> (Duration, Duration) {
        let t = &self.timing;
        let chars = body.chars().count() as u64;
        let jitter = if t.typing_jitter_ms > 0 { rng.random_range(0..=t.typing_jitter_ms) } else { 0 };
        let max_typing = t.max_typing_ms.max(t.min_typing_ms);
        let typing_ms = (t.base_typing_ms + t.per_char_ms * chars + jitter).clamp(
            t.min_typing_ms,
            max_typing
        );
        let max_pause = t.max_pause_ms.max(t.min_pause_ms);
        // the peer must stop typing strictly before the message lands
        let pause_ms = rng.random_range(t.min_pause_ms..=max_pause).max(1);

        (Duration::from_millis(typing_ms), Duration::from_millis(typing_ms + pause_ms))
    }
}

fn classify(message: &ChatMessage) -> Intent {
    match message.kind {
        MessageKind::Gift => {
            return Intent::Gift;
        }
        MessageKind::Photo => {
            return Intent::Photo;
        }
        MessageKind::Voice => {
            return Intent::Voice;
        }
        MessageKind::Challenge => {
            return Intent::Challenge;
        }
        MessageKind::PortfolioSnippet => {
            return Intent::Portfolio;
        }
        MessageKind::Text | MessageKind::Reaction => {}
    }

    let text = message.body.to_lowercase();
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    for (intent, keywords) in KEYWORDS {
        let hit = words
            .iter()
            .any(|word| {
                keywords
                    .iter()
                    .any(|kw| {
                        *word == *kw ||
                            (kw.len() > 3 && strsim::jaro_winkler(word, kw) >= FUZZY_MATCH_THRESHOLD)
                    })
            });
        if hit {
            return *intent;
        }
    }

    if text.trim_end().ends_with('?') { Intent::Question } else { Intent::SmallTalk }
}
