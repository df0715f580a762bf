//! Coarse genre tagging from track title and artist keywords.

use serde::{Deserialize, Serialize};

/// Coarse genre buckets. `Unknown` is the no-match sentinel and is never
/// shown or used in queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Genre {
    Devotional,
    Ghazal,
    Sufi,
    Qawwali,
    Punjabi,
    HipHop,
    Edm,
    Lofi,
    Classical,
    Rock,
    Indie,
    Bollywood,
    Pop,
    #[default]
    Unknown,
}

/// Keyword buckets in priority order: the first bucket with a hit wins.
/// Single-word keywords match whole words; phrases match as substrings.
const GENRE_KEYWORDS: &[(Genre, &[&str])] = &[
    (
        Genre::Devotional,
        &["bhajan", "aarti", "mantra", "kirtan", "bhakti", "chalisa", "shabad"],
    ),
    (Genre::Qawwali, &["qawwali", "nusrat fateh"]),
    (Genre::Ghazal, &["ghazal", "jagjit singh", "mehdi hassan"]),
    (Genre::Sufi, &["sufi", "maula", "khwaja", "rumi"]),
    (
        Genre::Lofi,
        &["lofi", "lo-fi", "slowed", "reverb", "chill beats"],
    ),
    (
        Genre::Punjabi,
        &["punjabi", "bhangra", "jatt", "diljit", "sidhu moose wala", "karan aujla"],
    ),
    (
        Genre::HipHop,
        &["rap", "hip hop", "hip-hop", "drill", "divine", "badshah", "emiway", "cypher"],
    ),
    (
        Genre::Edm,
        &["edm", "remix", "house", "techno", "trance", "dubstep", "avicii", "martin garrix"],
    ),
    (
        Genre::Classical,
        &["raag", "raga", "sitar", "classical", "symphony", "sonata", "concerto"],
    ),
    (Genre::Rock, &["rock", "metal", "grunge", "guitar solo"]),
    (
        Genre::Indie,
        &["indie", "unplugged", "acoustic", "prateek kuhad", "local train"],
    ),
    (
        Genre::Bollywood,
        &[
            "bollywood",
            "arijit singh",
            "shreya ghoshal",
            "a.r. rahman",
            "ar rahman",
            "atif aslam",
            "sonu nigam",
            "kishore kumar",
            "lata mangeshkar",
            "from the movie",
            "full video song",
        ],
    ),
    (
        Genre::Pop,
        &["pop", "taylor swift", "ed sheeran", "dua lipa", "the weeknd", "justin bieber"],
    ),
];

impl Genre {
    /// Lowercase label used in search queries, `None` for `Unknown`.
    pub fn as_query_term(self) -> Option<&'static str> {
        match self {
            Self::Devotional => Some("devotional"),
            Self::Ghazal => Some("ghazal"),
            Self::Sufi => Some("sufi"),
            Self::Qawwali => Some("qawwali"),
            Self::Punjabi => Some("punjabi"),
            Self::HipHop => Some("hip hop"),
            Self::Edm => Some("edm"),
            Self::Lofi => Some("lofi"),
            Self::Classical => Some("classical"),
            Self::Rock => Some("rock"),
            Self::Indie => Some("indie"),
            Self::Bollywood => Some("bollywood"),
            Self::Pop => Some("pop"),
            Self::Unknown => None,
        }
    }

    /// Title-cased label for display, `None` for `Unknown`.
    pub fn display_name(self) -> Option<String> {
        match self {
            Self::Edm => Some("EDM".to_string()),
            Self::Lofi => Some("Lo-Fi".to_string()),
            _ => self.as_query_term().map(|term| {
                term.split(' ')
                    .map(capitalize)
                    .collect::<Vec<_>>()
                    .join(" ")
            }),
        }
    }

    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn words(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|word| !word.is_empty())
        .collect()
}

fn keyword_matches(haystack: &str, haystack_words: &[&str], keyword: &str) -> bool {
    if keyword.contains(' ') || keyword.contains('.') {
        haystack.contains(keyword)
    } else {
        haystack_words.iter().any(|word| *word == keyword)
    }
}

/// Tags a track by scanning its lowercased title and artist against the
/// keyword table.
pub fn classify(title: &str, artist: &str) -> Genre {
    let haystack = format!("{} {}", title, artist).to_lowercase();
    let haystack_words = words(&haystack);
    GENRE_KEYWORDS
        .iter()
        .find(|(_, keywords)| {
            keywords
                .iter()
                .any(|keyword| keyword_matches(&haystack, &haystack_words, keyword))
        })
        .map(|(genre, _)| *genre)
        .unwrap_or(Genre::Unknown)
}
