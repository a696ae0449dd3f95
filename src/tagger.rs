//! Content-addressable tagging of text fragments.

use crate::db::{Database, ScopeLevel};
use crate::marker::{self, HASH_LEN};
use anyhow::{bail, Result};
use tracing::{debug, warn};

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Salted re-hashes tried before giving up on a colliding identifier.
const MAX_SALT: u32 = 16;

/// Identifier derived from `text`, optionally salted to escape a collision.
pub fn content_hash(text: &str, salt: u32) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(text.as_bytes());
    if salt > 0 {
        hasher.update(format!("\u{0}{}", salt).as_bytes());
    }
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest.as_bytes()[..16]);
    let mut value = u128::from_le_bytes(bytes);

    let mut out = String::with_capacity(HASH_LEN);
    for _ in 0..HASH_LEN {
        out.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagOutcome {
    pub text: String,
    /// `None` only for empty fragments.
    pub hash: Option<String>,
    pub changed: bool,
}

/// Tags fragments and records their source text.
#[derive(Clone)]
pub struct Tagger {
    db: Database,
}

impl Tagger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Tag one fragment.
    ///
    /// Already-tagged text is returned untouched, but every marker it carries
    /// is (re)mapped to `scope`. Untagged text gets ` {t:HASH}` appended and a
    /// `source` record if none exists for that identifier.
    pub fn tag(&self, text: &str, scope: Option<i64>, level: ScopeLevel) -> Result<TagOutcome> {
        let found = marker::find_all(text);
        if let Some(first) = found.first() {
            if let Some(scope_id) = scope {
                for hash in &found {
                    self.db.ensure_mapping(hash, scope_id)?;
                }
            }
            return Ok(TagOutcome {
                text: text.to_string(),
                hash: Some(first.to_string()),
                changed: false,
            });
        }

        let normalized = text.trim();
        if normalized.is_empty() {
            return Ok(TagOutcome {
                text: text.to_string(),
                hash: None,
                changed: false,
            });
        }

        let hash = self.identifier_for(normalized)?;
        if self.db.insert_source_if_absent(&hash, normalized, level)? {
            debug!("New source record {} ({} chars)", hash, normalized.len());
        }
        if let Some(scope_id) = scope {
            self.db.ensure_mapping(&hash, scope_id)?;
        }

        Ok(TagOutcome {
            text: marker::append_marker(text, &hash),
            hash: Some(hash),
            changed: true,
        })
    }

    /// Identifier for a source text: the one already used for the same text
    /// anywhere in the store, else its content hash (re-salted on collision).
    pub fn identifier_for(&self, text: &str) -> Result<String> {
        let normalized = text.trim();
        if let Some(existing) = self.db.find_hash_by_source(normalized)? {
            return Ok(existing);
        }
        self.free_identifier(normalized, normalized)
    }

    /// Identifier seeded by `seed` rather than by the source text itself.
    ///
    /// Used when a fragment's source had to be guessed: the same fragment
    /// always mints the same identifier, and reuses it while its source
    /// record still holds `source_text`.
    pub fn mint_identifier(&self, seed: &str, source_text: &str) -> Result<String> {
        self.free_identifier(seed, source_text.trim())
    }

    fn free_identifier(&self, seed: &str, source_text: &str) -> Result<String> {
        for salt in 0..MAX_SALT {
            let candidate = content_hash(seed, salt);
            match self.db.get_source(&candidate)? {
                Some(record) if record.text == source_text => return Ok(candidate),
                Some(_) => {
                    warn!("Identifier collision on {} (salt {}), re-hashing", candidate, salt);
                }
                None if self.db.list_languages(&candidate)?.is_empty() => return Ok(candidate),
                None => {
                    debug!("Identifier {} holds translations without a source, skipping", candidate);
                }
            }
        }
        bail!("No free identifier after {} salted attempts", MAX_SALT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SOURCE_LANG;
    use proptest::prelude::*;

    fn create_tagger() -> Tagger {
        Tagger::new(Database::open_in_memory().expect("Failed to create database"))
    }

    // ==================== Hash Tests ====================

    #[test]
    fn test_content_hash_shape() {
        let hash = content_hash("Submit", 0);
        assert_eq!(hash.len(), HASH_LEN);
        assert!(marker::is_valid_hash(&hash));
        assert_eq!(hash, content_hash("Submit", 0));
        assert_ne!(hash, content_hash("Submit", 1));
        assert_ne!(hash, content_hash("Cancel", 0));
    }

    proptest! {
        #[test]
        fn prop_content_hash_is_always_valid(text in ".*", salt in 0u32..20) {
            let hash = content_hash(&text, salt);
            prop_assert!(marker::is_valid_hash(&hash));
            prop_assert_eq!(hash, content_hash(&text, salt));
        }
    }

    // ==================== Tagging Tests ====================

    #[test]
    fn test_tag_appends_marker_and_creates_source() {
        let tagger = create_tagger();
        let outcome = tagger.tag("Submit", Some(1), ScopeLevel::Container).unwrap();
        let hash = outcome.hash.clone().unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.text, format!("Submit {{t:{}}}", hash));

        let source = tagger.db().get_source(&hash).unwrap().unwrap();
        assert_eq!(source.text, "Submit");
        assert_eq!(source.lang, SOURCE_LANG);
        assert!(!source.human);
        assert_eq!(tagger.db().scopes_for_hash(&hash).unwrap(), vec![1]);
    }

    #[test]
    fn test_tag_is_idempotent() {
        let tagger = create_tagger();
        let first = tagger.tag("Submit", Some(1), ScopeLevel::Container).unwrap();
        let second = tagger.tag(&first.text, Some(1), ScopeLevel::Container).unwrap();

        assert!(!second.changed);
        assert_eq!(second.text, first.text);
        assert_eq!(second.hash, first.hash);
        assert_eq!(tagger.db().list_languages(first.hash.as_deref().unwrap()).unwrap().len(), 1);
    }

    #[test]
    fn test_global_dedup_across_scopes() {
        let tagger = create_tagger();
        let a = tagger.tag("Submit", Some(1), ScopeLevel::Container).unwrap();
        let b = tagger.tag("  Submit  ", Some(2), ScopeLevel::Unit).unwrap();

        assert_eq!(a.hash, b.hash);
        let hash = a.hash.unwrap();
        assert_eq!(tagger.db().scopes_for_hash(&hash).unwrap(), vec![1, 2]);
        assert_eq!(tagger.db().list_languages(&hash).unwrap(), vec![SOURCE_LANG.to_string()]);
    }

    #[test]
    fn test_dedup_reuses_non_hash_identifier() {
        let tagger = create_tagger();
        tagger
            .db()
            .insert_source_if_absent("Legacy0001", "Submit", ScopeLevel::Container)
            .unwrap();
        let outcome = tagger.tag("Submit", None, ScopeLevel::Container).unwrap();
        assert_eq!(outcome.hash.as_deref(), Some("Legacy0001"));
    }

    #[test]
    fn test_empty_text_is_noop() {
        let tagger = create_tagger();
        for text in ["", "   ", "\n\t"] {
            let outcome = tagger.tag(text, Some(1), ScopeLevel::Container).unwrap();
            assert!(!outcome.changed);
            assert_eq!(outcome.hash, None);
            assert_eq!(outcome.text, text);
        }
        assert_eq!(tagger.db().mapping_count().unwrap(), 0);
    }

    #[test]
    fn test_tagged_text_restores_mappings() {
        let tagger = create_tagger();
        let text = "Intro {t:AAAAAAAAAA} and <t:BBBBBBBBBB>";
        let outcome = tagger.tag(text, Some(9), ScopeLevel::Container).unwrap();

        assert!(!outcome.changed);
        assert_eq!(outcome.hash.as_deref(), Some("AAAAAAAAAA"));
        assert_eq!(tagger.db().scopes_for_hash("AAAAAAAAAA").unwrap(), vec![9]);
        assert_eq!(tagger.db().scopes_for_hash("BBBBBBBBBB").unwrap(), vec![9]);
        // Observing a marker never invents a source record.
        assert!(tagger.db().get_source("AAAAAAAAAA").unwrap().is_none());
    }

    #[test]
    fn test_malformed_marker_is_retagged() {
        let tagger = create_tagger();
        let outcome = tagger.tag("Submit {t:short}", None, ScopeLevel::Container).unwrap();
        assert!(outcome.changed);
        assert!(outcome.text.starts_with("Submit {t:short} {t:"));
    }

    #[test]
    fn test_source_is_never_overwritten() {
        let tagger = create_tagger();
        let hash = content_hash("Submit", 0);
        tagger
            .db()
            .upsert(&hash, SOURCE_LANG, "Submit", ScopeLevel::Container, true)
            .unwrap();

        let outcome = tagger.tag("Submit", None, ScopeLevel::Unit).unwrap();
        assert_eq!(outcome.hash.as_deref(), Some(hash.as_str()));
        let source = tagger.db().get_source(&hash).unwrap().unwrap();
        assert!(source.human);
        assert_eq!(source.level, ScopeLevel::Container);
    }

    // ==================== Collision Tests ====================

    #[test]
    fn test_collision_uses_salted_hash() {
        let tagger = create_tagger();
        let taken = content_hash("Submit", 0);
        tagger
            .db()
            .insert_source_if_absent(&taken, "Something else entirely", ScopeLevel::Container)
            .unwrap();

        let hash = tagger.identifier_for("Submit").unwrap();
        assert_eq!(hash, content_hash("Submit", 1));
    }

    #[test]
    fn test_mint_identifier_is_stable_for_same_source() {
        let tagger = create_tagger();
        let fragment = "{mlang de}Hallo{mlang}{mlang it}Ciao{mlang}";
        let hash = tagger.mint_identifier(fragment, "Hallo").unwrap();
        tagger
            .db()
            .insert_source_if_absent(&hash, "Hallo", ScopeLevel::Container)
            .unwrap();

        assert_eq!(tagger.mint_identifier(fragment, "Hallo").unwrap(), hash);
        assert_ne!(tagger.mint_identifier(fragment, "Servus").unwrap(), hash);
    }
}
