//! # nideriji-export
//!
//! A CLI tool that exports [nideriji](https://nideriji.cn) diaries to local Markdown
//! files and renders them into a single static HTML page.
//!
//! ## What it does
//!
//! The tool logs in with your account, reads the diary index of either your own
//! account or your paired partner's, and fetches every diary in the chosen date
//! range. Private passages the app stores encrypted are decrypted with the
//! author's account id. Inline `[图N]` image placeholders become Markdown image
//! links, and the referenced pictures are downloaded next to the Markdown.
//!
//! ```text
//! myself/
//! ├── export_stats.json
//! ├── markdown/
//! │   └── 2024-03/
//! │       ├── 2024-03-05.md
//! │       └── Pictures/17.jpg
//! └── html/
//!     └── output/
//!         ├── diaries.html
//!         └── Pictures/17.jpg
//! ```
//!
//! ## Re-running
//!
//! Runs are idempotent. A date file is only rewritten when its content changed,
//! and images already present in a month's `Pictures/` folder are not
//! downloaded again.
//!
//! ## Usage
//!
//! ```sh
//! # Prompt for everything
//! nideriji-export
//!
//! # Partner's diaries for March 2024, no questions asked
//! nideriji-export --email me@example.com --partner --from 2024-03 --to 2024-03 --yes
//! ```
//!
//! Preferences can be persisted in `~/.config/nideriji-export/config.toml`.

pub mod client;
pub mod error;
pub mod exporter;
pub mod images;
pub mod model;
pub mod parallel;
pub mod privacy;
pub mod renderer;
pub mod utils;
