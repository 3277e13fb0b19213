//! Assign post categories from the blocks a post contains.
//!
//! Content is parsed into a block tree ([`parser::blocks`]), reduced to its
//! distinct block identifiers ([`parser::names`]) and reconciled against an
//! administrator's block → category mapping ([`reconcile`]).

pub mod config;
pub mod db;
pub mod embeds;
pub mod parser;
pub mod processor;
pub mod reconcile;
pub mod settings;
