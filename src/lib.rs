//! # tagsync
//!
//! Tags free-form content fragments with content-addressable identifiers,
//! extracts embedded multi-language markup into per-language translation
//! records, and drives an external translation API to fill in the missing
//! languages.
//!
//! ## Architecture
//!
//! - **[`marker`]** - the `{t:HASH}` marker pattern shared by every scanner
//! - **[`tagger`]** / **[`extractor`]** - in-place fragment rewriting
//! - **[`db`]** - SQLite translation store, scope mappings, cursors, jobs
//! - **[`content`]** / **[`registry`]** / **[`relations`]** - host content access
//! - **[`scan`]** - resumable tagging pass over the registered tables
//! - **[`scope`]** - scope mappings and their garbage collector
//! - **[`orchestrator`]** / **[`translation`]** / **[`retry`]** - batch translation jobs
//! - **[`management`]** - human edits of translations and source text
//! - **[`server`]** / **[`scheduler`]** - progress API and periodic work

pub mod app;
pub mod config;
pub mod content;
pub mod db;
pub mod extractor;
pub mod management;
pub mod marker;
pub mod orchestrator;
pub mod registry;
pub mod relations;
pub mod retry;
pub mod scan;
pub mod scheduler;
pub mod scope;
pub mod server;
pub mod tagger;
pub mod translation;
