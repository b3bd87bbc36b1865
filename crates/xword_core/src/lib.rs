//! Core of the xword client: a local cache of a remote XWiki's space/page
//! structure, the Confluence-compatible XML-RPC boundary it is populated from,
//! and the HTML cleanup helpers used before publishing edited content.

pub mod client;
pub mod config;
pub mod html;
pub mod structure;
pub mod sync;
pub mod xmlrpc;
