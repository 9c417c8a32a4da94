use lazy_static::lazy_static;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    Greeting,
    Compliment,
    Portfolio,
    Question,
    Gift,
    Photo,
    Voice,
    Challenge,
    SmallTalk,
}

/// Keyword lists checked in order; the first intent with a hit wins.
pub const KEYWORDS: &[(Intent, &[&str])] = &[
    (Intent::Greeting, &["gm", "gmgm", "hi", "hey", "hello", "yo", "sup", "morning", "hiya"]),
    (
        Intent::Compliment,
        &["cute", "beautiful", "gorgeous", "pretty", "handsome", "stunning", "adorable", "smile"],
    ),
    (
        Intent::Portfolio,
        &[
            "portfolio",
            "bag",
            "bags",
            "eth",
            "btc",
            "sol",
            "token",
            "tokens",
            "nft",
            "nfts",
            "wallet",
            "degen",
            "hodl",
            "crypto",
            "defi",
            "staking",
            "airdrop",
        ],
    ),
];

lazy_static! {
    pub static ref REPLIES: HashMap<Intent, &'static [&'static str]> = {
        let mut m: HashMap<Intent, &'static [&'static str]> = HashMap::new();
        m.insert(Intent::Greeting, &[
            "gm {name}! ☕ how's your day going?",
            "heyy {name} 👋 glad we matched",
            "gm gm! just saw your profile, love the vibe",
            "hey! finally someone who says gm back 😄",
        ]);
        m.insert(Intent::Compliment, &[
            "stop it, you're making me blush 😳",
            "aw thank you {name}, you're not so bad yourself",
            "that's sweet, you just made my day",
        ]);
        m.insert(Intent::Portfolio, &[
            "ok your bags are actually impressive 👀",
            "respect the conviction. I've been holding ETH since 2017",
            "we should compare charts over coffee sometime",
            "diamond hands or paper hands? be honest",
        ]);
        m.insert(Intent::Question, &[
            "good question! honestly still figuring that out 😅",
            "hmm let me think... what about you?",
            "depends on the day tbh. you?",
        ]);
        m.insert(Intent::Gift, &[
            "wait you sent me a gift?? 🎁 thank you!",
            "that's so thoughtful {name}, thank you 💜",
        ]);
        m.insert(Intent::Photo, &[
            "omg great pic 📸",
            "where was that taken? looks amazing",
        ]);
        m.insert(Intent::Voice, &[
            "love hearing your voice 🎧",
            "haha your voice is exactly how I imagined",
        ]);
        m.insert(Intent::Challenge, &[
            "challenge accepted 😤",
            "you're on. loser buys dinner",
        ]);
        m.insert(Intent::SmallTalk, &[
            "haha tell me more",
            "no way, same here!",
            "that's wild 😂",
            "ok I like the way you think",
        ]);
        m
    };
}
