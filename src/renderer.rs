//! Markdown tree → single HTML page.
//!
//! Reads the dated Markdown files an export produced, converts each into an
//! `<article>` block, and drops them into a template. Images referenced by a
//! file are resolved against that file's folder and copied into one flat
//! `Pictures/` folder next to the page.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDate;
use pulldown_cmark::{Event, Options, Parser, html};
use regex::{Captures, Regex};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::exporter::weekday_name;
use crate::model::parse_date;
use crate::utils::SortOrder;

/// Placeholder the template must contain.
pub const CONTENT_PLACEHOLDER: &str = "{{CONTENT_HTML}}";

/// Weekday names shown on the page, Monday first.
pub const HTML_WEEKDAYS: [&str; 7] = ["周一", "周二", "周三", "周四", "周五", "周六", "周日"];

pub const BUILTIN_TEMPLATE: &str = include_str!("../assets/template.html");

/// Static assets copied from the template folder when present.
const TEMPLATE_ASSETS: &[&str] = &["logo.png", "background.png"];

static MD_IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(!\[[^\]]*\]\()([^)\s]+)(\))").expect("image pattern is valid"));

#[derive(Clone, Debug)]
pub struct RenderOptions {
    pub markdown_root: PathBuf,
    /// Folder holding `template.html`, `logo.png` and `background.png`.
    pub template_dir: PathBuf,
    pub output_dir: PathBuf,
    pub order: SortOrder,
    pub weekdays: [&'static str; 7],
}

impl RenderOptions {
    pub fn output_file(&self) -> PathBuf {
        self.output_dir.join("diaries.html")
    }

    pub fn pictures_dir(&self) -> PathBuf {
        self.output_dir.join("Pictures")
    }
}

#[derive(Clone, Debug, Default)]
pub struct RenderReport {
    pub output_file: PathBuf,
    pub articles: usize,
    pub images_copied: usize,
    pub images_present: usize,
    pub images_missing: usize,
    pub files_skipped: usize,
}

struct DiaryFile {
    date: NaiveDate,
    path: PathBuf,
}

/// Collect the dated Markdown files under `root`, ordered by date.
/// Files whose stem is not a `YYYY-MM-DD` date are skipped.
fn collect_files(root: &Path, order: SortOrder, report: &mut RenderReport) -> Vec<DiaryFile> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "cannot read entry under markdown root");
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|e| e != "md") {
            continue;
        }
        let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
        match parse_date(&stem) {
            Some(date) => files.push(DiaryFile {
                date,
                path: path.to_path_buf(),
            }),
            None => {
                warn!(path = %path.display(), "file name is not a date, skipping");
                report.files_skipped += 1;
            }
        }
    }
    files.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.path.cmp(&b.path)));
    if order == SortOrder::Desc {
        files.reverse();
    }
    files
}

/// Drop the first line (the `==date weekday==` header).
fn strip_header(markdown: &str) -> &str {
    match markdown.find('\n') {
        Some(i) => &markdown[i + 1..],
        None => "",
    }
}

fn is_remote(target: &str) -> bool {
    let t = target.to_ascii_lowercase();
    t.starts_with("http://") || t.starts_with("https://") || t.starts_with("data:")
}

/// Copy each local image into `pictures_dir` and point the reference there.
fn relocate_images(
    markdown: &str,
    source_dir: &Path,
    pictures_dir: &Path,
    report: &mut RenderReport,
) -> String {
    MD_IMAGE_RE
        .replace_all(markdown, |caps: &Captures| {
            let target = &caps[2];
            if is_remote(target) {
                return caps[0].to_string();
            }
            let Some(name) = Path::new(target).file_name() else {
                return caps[0].to_string();
            };
            let source = source_dir.join(target);
            let dest = pictures_dir.join(name);
            if dest.exists() {
                report.images_present += 1;
            } else if source.is_file() {
                match fs::copy(&source, &dest) {
                    Ok(_) => report.images_copied += 1,
                    Err(e) => {
                        warn!(image = %source.display(), error = %e, "cannot copy image");
                        report.images_missing += 1;
                    }
                }
            } else {
                debug!(image = %source.display(), "referenced image not found");
                report.images_missing += 1;
            }
            format!("{}./Pictures/{}{}", &caps[1], name.to_string_lossy(), &caps[3])
        })
        .into_owned()
}

/// Markdown → HTML with single newlines kept as line breaks.
pub fn markdown_to_html(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(markdown, options).map(|event| match event {
        Event::SoftBreak => Event::HardBreak,
        other => other,
    });
    let mut out = String::new();
    html::push_html(&mut out, parser);
    out
}

fn article(date: NaiveDate, weekday: &str, body_html: &str) -> String {
    format!(
        r#"
<article class="diary">
  <header class="meta">
    <div class="date">{}</div>
    <div class="weekday">{}</div>
  </header>
  <section class="content">{}</section>
</article>
"#,
        date.format("%Y-%m-%d"),
        weekday,
        body_html
    )
}

fn load_template(template_dir: &Path) -> io::Result<String> {
    let path = template_dir.join("template.html");
    match fs::read_to_string(&path) {
        Ok(t) => Ok(t),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no template, using built-in one");
            Ok(BUILTIN_TEMPLATE.to_string())
        }
        Err(e) => Err(e),
    }
}

/// Render every diary under `markdown_root` into `output_dir/diaries.html`.
pub fn render_site(options: &RenderOptions) -> io::Result<RenderReport> {
    let mut report = RenderReport {
        output_file: options.output_file(),
        ..Default::default()
    };
    let pictures_dir = options.pictures_dir();
    fs::create_dir_all(&pictures_dir)?;

    let template = load_template(&options.template_dir)?;
    if !template.contains(CONTENT_PLACEHOLDER) {
        warn!("template has no {} placeholder, page will be empty", CONTENT_PLACEHOLDER);
    }

    let files = collect_files(&options.markdown_root, options.order, &mut report);
    let mut articles = Vec::with_capacity(files.len());
    for file in &files {
        let text = match fs::read_to_string(&file.path) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "cannot read diary file");
                report.files_skipped += 1;
                continue;
            }
        };
        let source_dir = file.path.parent().unwrap_or(&options.markdown_root);
        let body = relocate_images(strip_header(&text), source_dir, &pictures_dir, &mut report);
        articles.push(article(
            file.date,
            weekday_name(file.date, &options.weekdays),
            &markdown_to_html(&body),
        ));
    }
    report.articles = articles.len();

    let page = template.replace(CONTENT_PLACEHOLDER, &articles.join("\n"));
    crate::utils::write_atomic(&report.output_file, page.as_bytes())?;

    for asset in TEMPLATE_ASSETS {
        let source = options.template_dir.join(asset);
        if source.is_file() {
            fs::copy(&source, options.output_dir.join(asset))?;
        } else if *asset == "background.png" {
            warn!(path = %source.display(), "background image missing");
        }
    }

    info!(
        output = %report.output_file.display(),
        articles = report.articles,
        images_copied = report.images_copied,
        images_missing = report.images_missing,
        "html page rendered"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(root: &Path, order: SortOrder) -> RenderOptions {
        RenderOptions {
            markdown_root: root.join("markdown"),
            template_dir: root.join("html"),
            output_dir: root.join("html/output"),
            order,
            weekdays: HTML_WEEKDAYS,
        }
    }

    fn write(path: &Path, text: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    #[test]
    fn header_line_is_dropped() {
        assert_eq!(strip_header("==2024-03-05 星期二==\n\nbody"), "\nbody");
        assert_eq!(strip_header("only"), "");
    }

    #[test]
    fn soft_breaks_become_line_breaks() {
        let html = markdown_to_html("a\nb");
        assert!(html.contains("a<br />"), "{}", html);
    }

    #[test]
    fn remote_images_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = RenderReport::default();
        let md = "![x](https://example.com/a.png)";
        assert_eq!(relocate_images(md, dir.path(), dir.path(), &mut report), md);
    }

    #[test]
    fn renders_ordered_articles_and_copies_images() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("markdown/2024-03/2024-03-05.md"), "==2024-03-05 星期二==\n\n# 三月\n\n![图17](Pictures/17.jpg)\n");
        write(&root.join("markdown/2024-02/2024-02-01.md"), "==2024-02-01 星期四==\n\n二月\n");
        write(&root.join("markdown/2024-03/notes.md"), "not a diary");
        write(&root.join("markdown/2024-03/Pictures/17.jpg"), "jpeg");
        write(&root.join("html/template.html"), "<main>{{CONTENT_HTML}}</main>");

        let report = render_site(&options(root, SortOrder::Asc)).unwrap();
        assert_eq!(report.articles, 2);
        assert_eq!(report.files_skipped, 1);
        assert_eq!(report.images_copied, 1);

        let page = fs::read_to_string(root.join("html/output/diaries.html")).unwrap();
        assert!(page.starts_with("<main>"));
        let feb = page.find("2024-02-01").unwrap();
        let mar = page.find("2024-03-05").unwrap();
        assert!(feb < mar);
        assert!(page.contains("<div class=\"weekday\">周二</div>"));
        assert!(page.contains("src=\"./Pictures/17.jpg\""));
        assert!(!page.contains("=="));
        assert!(root.join("html/output/Pictures/17.jpg").is_file());

        // Second run: nothing copied again, nothing fails.
        let again = render_site(&options(root, SortOrder::Desc)).unwrap();
        assert_eq!(again.images_copied, 0);
        assert_eq!(again.images_present, 1);
        let page = fs::read_to_string(root.join("html/output/diaries.html")).unwrap();
        assert!(page.find("2024-03-05").unwrap() < page.find("2024-02-01").unwrap());
    }

    #[test]
    fn falls_back_to_builtin_template() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("markdown/2024-01/2024-01-01.md"), "==h==\nhi\n");
        render_site(&options(dir.path(), SortOrder::Asc)).unwrap();
        let page = fs::read_to_string(dir.path().join("html/output/diaries.html")).unwrap();
        assert!(page.contains("<!DOCTYPE html>"));
        assert!(page.contains("<article class=\"diary\">"));
        assert!(!page.contains(CONTENT_PLACEHOLDER));
    }
}
