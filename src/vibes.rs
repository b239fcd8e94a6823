//! Profile-text heuristics behind the `autolabel_*_vibes` actor flags.

use lazy_static::lazy_static;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Auto-labels derived from a profile description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VibeCheck {
    /// Feminine.
    pub fem: bool,
    /// Non-binary.
    pub enby: bool,
    /// Masculine.
    pub masc: bool,
}

struct Vibes {
    emoji: &'static [&'static str],
    words: Regex,
    extra: Regex,
}

impl Vibes {
    fn new(emoji: &'static [&'static str], words: &[&str], extra: &str) -> Self {
        let alternation = words
            .iter()
            .map(|w| regex::escape(w))
            .collect::<Vec<_>>()
            .join("|");
        Self {
            emoji,
            words: Regex::new(&format!(r"\b({alternation})\b")).expect("vibe word list compiles"),
            extra: Regex::new(extra).expect("vibe pattern compiles"),
        }
    }

    fn matches(&self, text: &str) -> bool {
        self.emoji.iter().any(|e| text.contains(e))
            || self.words.is_match(text)
            || self.extra.is_match(text)
    }
}

lazy_static! {
    static ref FEM: Vibes = Vibes::new(
        &["♀", "⚢"],
        &[
            "she", "her", "hers", "f", "woman", "female", "girl", "girls", "transgirl", "tgirl",
            "transwoman", "puppygirl", "doggirl", "catgirl", "lesbian", "sapphic", "gal",
        ],
        r"\b\d\df\b",
    );
    static ref MASC: Vibes = Vibes::new(
        &["♂️"],
        &[
            "he", "him", "his", "m", "man", "men", "male", "boy", "boys", "boi", "femboy",
            "dogboy", "catboy", "tboy", "tboi", "transman", "transmale", "transmasc", "himbo",
            "boyo",
        ],
        r"\b\d\dm\b",
    );
    static ref ENBY: Vibes = Vibes::new(
        &[],
        &[
            "they",
            "them",
            "enby",
            "nb",
            "nonbinary",
            "non-binary",
            "thembo",
            "any pronouns",
            "any pronounce",
            "any prns",
            "genderfluid",
            "genderflux",
            "agender",
            "agendered",
            "it/its",
        ],
        r"\b\d\dnb\b",
    );
}

fn normalize(text: &str) -> String {
    text.nfkc()
        .collect::<String>()
        .replace('\n', " ")
        .replace(['\'', '’'], "")
        .replace(['丨', '/'], " ")
        .to_lowercase()
}

/// Classifies a profile description.
pub fn vibecheck(description: &str) -> VibeCheck {
    let text = normalize(description);
    VibeCheck {
        fem: FEM.matches(&text),
        enby: ENBY.matches(&text),
        masc: MASC.matches(&text),
    }
}
