//! Splits embedded multi-language markup into translation records.
//!
//! Two block syntaxes are recognised:
//!
//! - `<span lang="es" class="multilang">Hola</span>` (any attribute order,
//!   the class list only has to contain `multilang`)
//! - `{mlang es}Hola{mlang}`, including language lists such as `{mlang en,fr}`
//!
//! Extraction is one-way. The blocks are replaced by the source text and a
//! single marker, and the other languages live on as records. Text before,
//! between and after the blocks is kept; text between blocks follows the
//! marker.

use crate::db::{ScopeLevel, TranslationWrite};
use crate::marker;
use crate::tagger::Tagger;
use anyhow::Result;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::debug;

/// Language code of a block meant for every language without its own block.
pub const OTHER_LANG: &str = "other";

static SPAN_RE: OnceLock<Regex> = OnceLock::new();
static MLANG_RE: OnceLock<Regex> = OnceLock::new();
static LANG_ATTR_RE: OnceLock<Regex> = OnceLock::new();
static CLASS_ATTR_RE: OnceLock<Regex> = OnceLock::new();

fn span_regex() -> &'static Regex {
    SPAN_RE.get_or_init(|| {
        Regex::new(r"(?is)<span\b([^>]*)>(.*?)</span\s*>").expect("span pattern is a valid regex")
    })
}

fn mlang_regex() -> &'static Regex {
    MLANG_RE.get_or_init(|| {
        Regex::new(r"(?is)\{\s*mlang\s+([A-Za-z0-9_,\s-]+?)\s*\}(.*?)\{\s*mlang\s*\}")
            .expect("mlang pattern is a valid regex")
    })
}

fn lang_attr_regex() -> &'static Regex {
    LANG_ATTR_RE.get_or_init(|| {
        Regex::new(r#"(?i)(?:^|\s)lang\s*=\s*["']([^"']+)["']"#).expect("lang pattern is a valid regex")
    })
}

fn class_attr_regex() -> &'static Regex {
    CLASS_ATTR_RE.get_or_init(|| {
        Regex::new(r#"(?i)(?:^|\s)class\s*=\s*["']([^"']*)["']"#).expect("class pattern is a valid regex")
    })
}

/// One language block found in a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub start: usize,
    pub end: usize,
    pub langs: Vec<String>,
    pub text: String,
}

fn normalize_lang(lang: &str) -> String {
    lang.trim().to_lowercase().replace('-', "_")
}

/// Every language block in `text`, in order, overlaps dropped.
pub fn find_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();

    for caps in span_regex().captures_iter(text) {
        let (Some(whole), Some(attrs), Some(inner)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let is_multilang = class_attr_regex()
            .captures(attrs.as_str())
            .and_then(|c| c.get(1))
            .map(|c| c.as_str().split_whitespace().any(|cls| cls.eq_ignore_ascii_case("multilang")))
            .unwrap_or(false);
        let lang = lang_attr_regex()
            .captures(attrs.as_str())
            .and_then(|c| c.get(1))
            .map(|l| normalize_lang(l.as_str()));

        if let (true, Some(lang)) = (is_multilang, lang) {
            blocks.push(Block {
                start: whole.start(),
                end: whole.end(),
                langs: vec![lang],
                text: inner.as_str().to_string(),
            });
        }
    }

    for caps in mlang_regex().captures_iter(text) {
        let (Some(whole), Some(langs), Some(inner)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let langs: Vec<String> = langs
            .as_str()
            .split(',')
            .map(normalize_lang)
            .filter(|l| !l.is_empty())
            .collect();
        if langs.is_empty() {
            continue;
        }
        blocks.push(Block {
            start: whole.start(),
            end: whole.end(),
            langs,
            text: inner.as_str().to_string(),
        });
    }

    blocks.sort_by_key(|b| b.start);
    let mut kept: Vec<Block> = Vec::with_capacity(blocks.len());
    for block in blocks {
        match kept.last() {
            Some(previous) if block.start < previous.end => {
                debug!("Dropping block at {} overlapping block at {}", block.start, previous.start);
            }
            _ => kept.push(block),
        }
    }
    kept
}

/// Text outside every block, whitespace-collapsed at the joins.
fn plain_text(text: &str, blocks: &[Block]) -> String {
    let mut pieces = Vec::new();
    let mut pos = 0;
    for block in blocks {
        pieces.push(&text[pos..block.start]);
        pos = block.end;
    }
    pieces.push(&text[pos..]);
    pieces
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Language settings the extractor resolves sources against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractContext {
    pub site_language: String,
    pub interface_language: String,
}

impl Default for ExtractContext {
    fn default() -> Self {
        Self {
            site_language: "en".to_string(),
            interface_language: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SourceOrigin {
    Block(usize),
    Plain,
    FirstBlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOutcome {
    pub text: String,
    pub hash: String,
    /// Languages written as records, sorted.
    pub languages: Vec<String>,
}

pub struct Extractor {
    tagger: Tagger,
    context: ExtractContext,
}

impl Extractor {
    pub fn new(tagger: Tagger, context: ExtractContext) -> Self {
        let context = ExtractContext {
            site_language: normalize_lang(&context.site_language),
            interface_language: normalize_lang(&context.interface_language),
        };
        Self { tagger, context }
    }

    /// Extract the language blocks of one fragment.
    ///
    /// Returns `None` when the fragment has no blocks or already carries a
    /// marker; the caller then falls back to plain tagging.
    pub fn extract(
        &self,
        text: &str,
        scope: Option<i64>,
        level: ScopeLevel,
    ) -> Result<Option<ExtractOutcome>> {
        if marker::contains_marker(text) {
            return Ok(None);
        }
        let blocks = find_blocks(text);
        if blocks.is_empty() {
            return Ok(None);
        }

        let plain = plain_text(text, &blocks);
        let origin = self.resolve_source(&blocks, &plain);
        let source_text = match origin {
            SourceOrigin::Block(i) => blocks[i].text.trim().to_string(),
            SourceOrigin::Plain => plain.clone(),
            SourceOrigin::FirstBlock => blocks[0].text.trim().to_string(),
        };
        if source_text.is_empty() {
            debug!("Language blocks resolve to an empty source, leaving fragment alone");
            return Ok(None);
        }

        let hash = match origin {
            SourceOrigin::FirstBlock => self.tagger.mint_identifier(text, &source_text)?,
            _ => self.tagger.identifier_for(&source_text)?,
        };

        let db = self.tagger.db();
        db.insert_source_if_absent(&hash, &source_text, level)?;

        let source_index = match origin {
            SourceOrigin::Block(i) => Some(i),
            SourceOrigin::FirstBlock => Some(0),
            SourceOrigin::Plain => None,
        };
        let mut translations: BTreeMap<String, String> = BTreeMap::new();
        for (i, block) in blocks.iter().enumerate() {
            let block_text = block.text.trim();
            if block_text.is_empty() {
                continue;
            }
            for lang in &block.langs {
                if lang == OTHER_LANG || lang == crate::db::SOURCE_LANG {
                    continue;
                }
                if Some(i) == source_index && *lang == self.context.site_language {
                    continue;
                }
                translations.insert(lang.clone(), block_text.to_string());
            }
        }

        let writes: Vec<TranslationWrite> = translations
            .iter()
            .map(|(lang, block_text)| TranslationWrite {
                hash: hash.clone(),
                lang: lang.clone(),
                text: block_text.clone(),
                level,
                human: true,
            })
            .collect();
        db.upsert_batch(&writes)?;

        if let Some(scope_id) = scope {
            db.ensure_mapping(&hash, scope_id)?;
        }

        let rewritten = match origin {
            SourceOrigin::Plain => marker::append_marker(&plain, &hash),
            _ => {
                let first = &blocks[0];
                let last = &blocks[blocks.len() - 1];
                let between: String = blocks
                    .windows(2)
                    .map(|pair| text[pair[0].end..pair[1].start].trim())
                    .filter(|gap| !gap.is_empty())
                    .map(|gap| format!(" {}", gap))
                    .collect();
                format!(
                    "{}{} {}{}{}",
                    &text[..first.start],
                    source_text,
                    marker::format_marker(&hash),
                    between,
                    &text[last.end..]
                )
            }
        };

        debug!(
            "Extracted {} language(s) into {} ({:?})",
            writes.len(),
            hash,
            origin
        );

        Ok(Some(ExtractOutcome {
            text: rewritten,
            hash,
            languages: translations.into_keys().collect(),
        }))
    }

    fn resolve_source(&self, blocks: &[Block], plain: &str) -> SourceOrigin {
        let has_lang = |lang: &str| blocks.iter().position(|b| b.langs.iter().any(|l| l == lang));

        if let Some(i) = has_lang(OTHER_LANG) {
            return SourceOrigin::Block(i);
        }
        if let Some(i) = has_lang(&self.context.site_language) {
            return SourceOrigin::Block(i);
        }
        if self.context.interface_language == self.context.site_language && !plain.is_empty() {
            return SourceOrigin::Plain;
        }
        SourceOrigin::FirstBlock
    }
}
