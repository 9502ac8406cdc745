//! Search term sampling from previously stored records.

use std::collections::BTreeSet;
use std::sync::Arc;

use bcat_core::{SampleRow, Term, TermSource, AUTHOR_DELIMITER};
use bcat_storage::BookStore;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use tracing::{debug, warn};

/// Used whenever sampling yields nothing, so a run always has something to search.
pub const FALLBACK_TERMS: [&str; 4] = ["통계", "데이터", "Statistics", "Data"];

const MIN_HANGUL_NOUN_CHARS: usize = 2;
const MIN_LATIN_NOUN_CHARS: usize = 4;

/// Stored field a batch of terms is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermStrategy {
    Title,
    Author,
    Publisher,
}

impl TermStrategy {
    pub const ALL: [TermStrategy; 3] = [
        TermStrategy::Title,
        TermStrategy::Author,
        TermStrategy::Publisher,
    ];

    pub fn source(self) -> TermSource {
        match self {
            TermStrategy::Title => TermSource::Title,
            TermStrategy::Author => TermSource::Author,
            TermStrategy::Publisher => TermSource::Publisher,
        }
    }

    pub fn extract(self, rows: &[SampleRow]) -> BTreeSet<String> {
        match self {
            TermStrategy::Title => rows
                .iter()
                .filter_map(|row| row.title.as_deref())
                .flat_map(title_terms)
                .collect(),
            TermStrategy::Author => rows
                .iter()
                .filter_map(|row| row.author.as_deref())
                .flat_map(|authors| authors.split(AUTHOR_DELIMITER))
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
            TermStrategy::Publisher => rows
                .iter()
                .filter_map(|row| row.publisher.as_deref())
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

fn is_hangul_syllable(c: char) -> bool {
    ('\u{AC00}'..='\u{D7A3}').contains(&c)
}

pub fn contains_hangul(text: &str) -> bool {
    text.chars().any(is_hangul_syllable)
}

/// Noun candidates from one title.
pub fn title_terms(title: &str) -> Vec<String> {
    if contains_hangul(title) {
        hangul_nouns(title)
    } else {
        latin_nouns(title)
    }
}

// Longest first so "으로" wins over "로".
const PARTICLES: &[&str] = &[
    "에서는", "으로써", "으로는", "이라는", "에게서", "에서", "에게", "으로", "까지", "부터",
    "처럼", "보다", "라는", "이란", "과의", "와의", "에는", "은", "는", "을", "를", "의", "에",
    "와", "과", "로",
];

const PREDICATE_ENDINGS: &[&str] = &[
    "하는", "되는", "하기", "하다", "한다", "했다", "있는", "없는", "하고", "하여", "해야",
    "우는", "주는", "보는", "오는", "가는",
];

const HANGUL_STOPWORDS: &[&str] = &[
    "위한", "대한", "통한", "관한", "그리고", "모든", "이런", "그런", "어떻게", "무엇", "우리",
];

fn strip_particle(run: &str) -> &str {
    let len = run.chars().count();
    for particle in PARTICLES {
        if let Some(stem) = run.strip_suffix(particle) {
            if len - particle.chars().count() >= MIN_HANGUL_NOUN_CHARS {
                return stem;
            }
        }
    }
    run
}

/// Hangul noun candidates: syllable runs with trailing particles removed,
/// predicate-like runs and stopwords discarded, at least two syllables long.
pub fn hangul_nouns(title: &str) -> Vec<String> {
    let mut nouns = Vec::new();
    let mut run = String::new();
    let mut flush = |run: &mut String| {
        if run.is_empty() {
            return;
        }
        let stem = strip_particle(run);
        let predicate = PREDICATE_ENDINGS
            .iter()
            .any(|ending| run.ends_with(ending) || stem.ends_with(ending));
        if !predicate
            && !HANGUL_STOPWORDS.contains(&stem)
            && stem.chars().count() >= MIN_HANGUL_NOUN_CHARS
        {
            nouns.push(stem.to_string());
        }
        run.clear();
    };

    for c in title.chars() {
        if is_hangul_syllable(c) {
            run.push(c);
        } else {
            flush(&mut run);
        }
    }
    flush(&mut run);
    nouns
}

/// Coarse part-of-speech classes assigned by [`tag_token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosTag {
    Noun,
    Verb,
    Adjective,
    Adverb,
    Determiner,
    Preposition,
    Pronoun,
    Conjunction,
    Number,
}

const DETERMINERS: &[&str] = &[
    "a", "an", "the", "this", "that", "these", "those", "every", "each", "some", "any", "all",
    "no", "another", "such", "both", "either", "neither",
];

const PREPOSITIONS: &[&str] = &[
    "of", "in", "on", "at", "by", "for", "with", "from", "to", "into", "onto", "about", "over",
    "under", "between", "through", "without", "within", "across", "after", "before", "beyond",
    "during", "toward", "towards", "upon", "via", "versus", "among", "around", "against",
];

const PRONOUNS: &[&str] = &[
    "i", "you", "he", "she", "it", "we", "they", "me", "him", "her", "us", "them", "my", "your",
    "his", "its", "our", "their", "what", "which", "who", "whom", "whose", "yourself",
];

const CONJUNCTIONS: &[&str] = &[
    "and", "or", "but", "nor", "yet", "so", "if", "because", "while", "when", "where", "how",
    "why", "than", "whether", "although", "though", "unless",
];

const VERBS: &[&str] = &[
    "is", "are", "was", "were", "be", "been", "being", "am", "do", "does", "did", "have", "has",
    "had", "can", "could", "will", "would", "shall", "should", "may", "might", "must", "make",
    "get", "learn", "build", "use", "become", "start", "know",
];

const ADJECTIVE_SUFFIXES: &[&str] = &["ous", "ful", "ive", "able", "ible", "less", "ical"];

fn word_tokens(text: &str) -> Vec<&str> {
    text.split_whitespace()
        .flat_map(|chunk| chunk.split(|c: char| matches!(c, ',' | ';' | ':' | '/' | '|' | '(' | ')' | '[' | ']')))
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|token| !token.is_empty())
        .collect()
}

/// Rule-based tag for one token: closed-class word lists first, then suffixes.
/// Anything left over is treated as a noun, which matches how capitalised
/// title words behave.
pub fn tag_token(token: &str) -> PosTag {
    let lower = token.to_lowercase();
    let word = lower.as_str();

    if word.chars().all(|c| c.is_numeric() || c == '.' || c == ',') {
        return PosTag::Number;
    }
    if DETERMINERS.contains(&word) {
        return PosTag::Determiner;
    }
    if PREPOSITIONS.contains(&word) {
        return PosTag::Preposition;
    }
    if PRONOUNS.contains(&word) {
        return PosTag::Pronoun;
    }
    if CONJUNCTIONS.contains(&word) {
        return PosTag::Conjunction;
    }
    if VERBS.contains(&word) {
        return PosTag::Verb;
    }
    if word.len() > 4 && word.ends_with("ly") {
        return PosTag::Adverb;
    }
    if ADJECTIVE_SUFFIXES.iter().any(|suffix| word.ends_with(suffix)) {
        return PosTag::Adjective;
    }
    let lowercase_start = token.chars().next().map(char::is_lowercase).unwrap_or(false);
    if lowercase_start && (word.ends_with("ing") || word.ends_with("ed")) {
        return PosTag::Verb;
    }
    PosTag::Noun
}

/// Tokens tagged as nouns, at least four characters, containing a letter.
pub fn latin_nouns(title: &str) -> Vec<String> {
    word_tokens(title)
        .into_iter()
        .filter(|token| token.chars().any(char::is_alphabetic))
        .filter(|token| token.chars().count() >= MIN_LATIN_NOUN_CHARS)
        .filter(|token| tag_token(token) == PosTag::Noun)
        .map(str::to_string)
        .collect()
}

fn fallback_terms() -> Vec<Term> {
    FALLBACK_TERMS
        .iter()
        .map(|text| Term::new(*text, TermSource::Fallback))
        .collect()
}

pub struct TermSampler {
    store: Arc<dyn BookStore>,
}

impl TermSampler {
    pub fn new(store: Arc<dyn BookStore>) -> Self {
        Self { store }
    }

    async fn read_sample(&self, sample_size: usize) -> Vec<SampleRow> {
        match self.store.sample_rows(sample_size).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "term sample read failed; using fallback vocabulary");
                Vec::new()
            }
        }
    }

    /// Up to `batch_size` distinct terms in random order. Never empty.
    pub async fn sample<R>(
        &self,
        strategy: TermStrategy,
        batch_size: usize,
        sample_size: usize,
        rng: &mut R,
    ) -> Vec<Term>
    where
        R: Rng + ?Sized,
    {
        let rows = self.read_sample(sample_size).await;
        let extracted = strategy.extract(&rows);

        let mut terms: Vec<Term> = if extracted.is_empty() {
            warn!(strategy = ?strategy, rows = rows.len(), "no qualifying terms; using fallback vocabulary");
            fallback_terms()
        } else {
            extracted
                .into_iter()
                .map(|text| Term::new(text, strategy.source()))
                .collect()
        };

        terms.shuffle(rng);
        terms.truncate(batch_size.max(1));
        debug!(strategy = ?strategy, terms = terms.len(), "sampled terms");
        terms
    }

    /// Legacy single-term sampling: one randomly chosen field, one term.
    pub async fn sample_one<R>(&self, sample_size: usize, rng: &mut R) -> Term
    where
        R: Rng + ?Sized,
    {
        let rows = self.read_sample(sample_size).await;
        let strategy = TermStrategy::ALL[rng.random_range(0..TermStrategy::ALL.len())];
        let candidates: Vec<String> = strategy.extract(&rows).into_iter().collect();

        match candidates.choose(rng) {
            Some(text) => Term::new(text.clone(), strategy.source()),
            None => {
                warn!(strategy = ?strategy, rows = rows.len(), "no qualifying terms; using fallback vocabulary");
                let text = FALLBACK_TERMS[rng.random_range(0..FALLBACK_TERMS.len())];
                Term::new(text, TermSource::Fallback)
            }
        }
    }
}
