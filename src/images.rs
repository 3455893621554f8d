//! Inline image placeholders.
//!
//! Diary bodies reference images as `[图17]`. On export each placeholder
//! becomes a Markdown image, `![图17](Pictures/17.jpg)`, and the alt text keeps
//! the id so the Markdown form can be scanned back into the same id set.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::model::ImageId;

/// Extensions an exported image may carry, in lookup order.
pub const KNOWN_EXTENSIONS: &[&str] = &["jpg", "png", "gif", "webp", "bmp", "heic", "avif", "tif"];

/// Extension used when nothing better is known.
pub const DEFAULT_EXTENSION: &str = "jpg";

/// Map an extension or format name onto [`KNOWN_EXTENSIONS`]. Unknown names
/// become [`DEFAULT_EXTENSION`], so every stored file can be found again.
pub fn normalize_extension(name: &str) -> &'static str {
    let name = name.trim().trim_start_matches('.').to_ascii_lowercase();
    match name.as_str() {
        "jpeg" | "jpe" => "jpg",
        "heif" => "heic",
        "tiff" => "tif",
        other => KNOWN_EXTENSIONS
            .iter()
            .copied()
            .find(|known| *known == other)
            .unwrap_or(DEFAULT_EXTENSION),
    }
}

// `![图N](path)` is Markdown image syntax, not a placeholder. The target must
// look like a path or URL; `![图3](笑)` is a placeholder followed by text.
static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(!?)\[图(\d+)\](\([A-Za-z0-9._~/:%?=&#+-]+\))?")
        .expect("placeholder pattern is valid")
});

static MARKDOWN_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!\[图(\d+)\]\([A-Za-z0-9._~/:%?=&#+-]+\)").expect("markdown image pattern is valid")
});

fn is_markdown(caps: &Captures) -> bool {
    !caps[1].is_empty() && caps.get(3).is_some()
}

fn placeholders(body: &str) -> impl Iterator<Item = Captures<'_>> {
    PLACEHOLDER_RE
        .captures_iter(body)
        .filter(|caps| !is_markdown(caps))
}

/// Every image id referenced by a placeholder, deduplicated.
pub fn extract_ids(body: &str) -> BTreeSet<ImageId> {
    placeholders(body)
        .filter_map(|caps| caps[2].parse().ok().map(ImageId))
        .collect()
}

/// Replace each placeholder with a Markdown image pointing at `resolve_path(id)`.
/// Placeholders whose id does not parse are left as they are.
pub fn rewrite(body: &str, resolve_path: impl Fn(ImageId) -> String) -> String {
    PLACEHOLDER_RE
        .replace_all(body, |caps: &Captures| {
            if is_markdown(caps) {
                return caps[0].to_string();
            }
            match caps[2].parse() {
                Ok(id) => format!(
                    "{}![图{}]({}){}",
                    &caps[1],
                    &caps[2],
                    resolve_path(ImageId(id)),
                    caps.get(3).map_or("", |m| m.as_str())
                ),
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Ids recovered from Markdown images produced by [`rewrite`].
pub fn extract_markdown_ids(body: &str) -> BTreeSet<ImageId> {
    MARKDOWN_IMAGE_RE
        .captures_iter(body)
        .filter_map(|caps| caps[1].parse().ok().map(ImageId))
        .collect()
}

/// File name an image is stored under.
pub fn image_file_name(id: ImageId, extension: &str) -> String {
    format!("{}.{}", id, extension)
}

/// An already-downloaded file for `id` in `dir`, whatever its extension.
pub fn find_existing(dir: &Path, id: ImageId) -> Option<PathBuf> {
    KNOWN_EXTENSIONS
        .iter()
        .map(|ext| dir.join(image_file_name(id, ext)))
        .find(|p| p.is_file())
}

/// Extension of the stored file for `id`, or the default when absent.
pub fn stored_extension(dir: &Path, id: ImageId) -> String {
    find_existing(dir, id)
        .and_then(|p| p.extension().map(|e| e.to_string_lossy().into_owned()))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpg(id: ImageId) -> String {
        format!("Pictures/{}.jpg", id)
    }

    #[test]
    fn extracts_deduplicated_ids() {
        let ids = extract_ids("见 [图17] 和 [图42]，又见 [图17]");
        assert_eq!(ids, BTreeSet::from([ImageId(17), ImageId(42)]));
        assert!(extract_ids("没有图片 [图] [图x]").is_empty());
    }

    #[test]
    fn overflowing_ids_are_skipped() {
        let ids = extract_ids("[图99999999999999999999999] [图3]");
        assert_eq!(ids, BTreeSet::from([ImageId(3)]));
    }

    #[test]
    fn rewrites_to_markdown_images() {
        assert_eq!(
            rewrite("见 [图17] 和 [图42]", jpg),
            "见 ![图17](Pictures/17.jpg) 和 ![图42](Pictures/42.jpg)"
        );
    }

    #[test]
    fn rewrite_is_idempotent() {
        let once = rewrite("a [图1] b [图2]", jpg);
        assert_eq!(rewrite(&once, jpg), once);
        assert!(extract_ids(&once).is_empty());
    }

    #[test]
    fn exclamation_before_placeholder_is_kept() {
        assert_eq!(rewrite("好!![图3]", jpg), "好!!![图3](Pictures/3.jpg)");
        assert_eq!(rewrite("好![图3] (笑)", jpg), "好!![图3](Pictures/3.jpg) (笑)");
        assert_eq!(extract_ids("好![图3]"), BTreeSet::from([ImageId(3)]));
    }

    #[test]
    fn parenthesised_text_is_not_a_link_target() {
        assert_eq!(extract_ids("好![图3](笑)"), BTreeSet::from([ImageId(3)]));
        assert_eq!(rewrite("好![图3](笑)", jpg), "好!![图3](Pictures/3.jpg)(笑)");
        assert!(extract_ids("![图3](Pictures/3.heic)").is_empty());
    }

    #[test]
    fn extensions_normalize_to_known_names() {
        assert_eq!(normalize_extension("jpeg"), "jpg");
        assert_eq!(normalize_extension("heif"), "heic");
        assert_eq!(normalize_extension("TIFF"), "tif");
        assert_eq!(normalize_extension("avif"), "avif");
        assert_eq!(normalize_extension("jxr"), DEFAULT_EXTENSION);
        for ext in KNOWN_EXTENSIONS {
            assert_eq!(normalize_extension(ext), *ext);
        }
    }

    #[test]
    fn markdown_scan_recovers_the_same_ids() {
        let body = "[图5]\n段落 [图8] [图5] 还有 [图13]";
        let rewritten = rewrite(body, |id| format!("../x/{}.png", id));
        assert_eq!(extract_markdown_ids(&rewritten), extract_ids(body));
    }

    #[test]
    fn finds_stored_files_by_any_extension() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(stored_extension(dir.path(), ImageId(4)), "jpg");
        std::fs::write(dir.path().join("4.png"), b"x").unwrap();
        assert_eq!(stored_extension(dir.path(), ImageId(4)), "png");
        assert_eq!(find_existing(dir.path(), ImageId(5)), None);
    }
}
