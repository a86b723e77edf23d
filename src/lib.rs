//! # Note Harness
//!
//! Bidirectional conversion between GitHub-flavored markdown and ENML, the
//! constrained XHTML dialect of the note service, with attachments managed
//! by content digest.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌────────────┐   resource:<md5>   ┌──────────────┐
//!  markdown ────▶ │  enml      │ ─────────────────▶ │  ENML body   │
//!                 │ (forward)  │ ◀─ AttachmentReg.  │ + attachments│
//!                 └────────────┘                    └──────┬───────┘
//!                       ▲                                  │
//!                       │        ┌────────────┐            │
//!                       └─────── │  patch     │ ◀──────────┤
//!                                └────────────┘            ▼
//!                                                  ┌──────────────┐
//!  markdown ◀──────────────────────────────────────│  markdown    │
//!                                                  │  (reverse)   │
//!                                                  └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use note_harness::enml::markdown_to_enml;
//! use note_harness::markdown::enml_to_markdown;
//! use note_harness::models::ConversionOptions;
//!
//! let result = markdown_to_enml("# Hi\n\n- [x] done\n", &[], &ConversionOptions::default());
//! assert!(result.body.contains(r#"<en-todo checked="true"/>"#));
//! assert_eq!(enml_to_markdown(&result.body, &result.attachments), "# Hi\n\n- [x] done\n");
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`digest`] | MD5 content digests and `resource:` pseudo-URLs |
//! | [`models`] | Attachments, conversion results, replacement rules |
//! | [`attachments`] | Per-conversion deduplicating registry |
//! | [`resolve`] | Image/link target classification and loading |
//! | [`sanitize`] | ENML element/attribute allow-list |
//! | [`enml`] | Markdown → ENML |
//! | [`markdown`] | ENML → markdown |
//! | [`patch`] | Find/replace through the markdown projection |
//! | [`config`] | TOML configuration parsing |
//! | [`traits`] | Tool trait, registry and built-in tools |
//! | [`server`] | HTTP tool server |
//! | [`commands`] | `nh` subcommand implementations |

pub mod attachments;
pub mod commands;
pub mod config;
pub mod digest;
pub mod enml;
pub mod markdown;
pub mod models;
pub mod patch;
pub mod resolve;
pub mod sanitize;
pub mod server;
pub mod traits;
