use crate::images;
use crate::model::{DiaryRecord, ImageId};
use crate::utils::{self, ProcessResult};
use chrono::{Datelike, NaiveDate};
use std::io::{self, Write};
use std::path::Path;

/// Weekday names used in the Markdown date header, Monday first.
pub const MARKDOWN_WEEKDAYS: [&str; 7] = [
    "星期一", "星期二", "星期三", "星期四", "星期五", "星期六", "星期日",
];

#[derive(Clone, Copy, Debug)]
pub struct MarkdownOptions {
    pub strip_indent: bool,
}

/// Localised weekday of `date` from a Monday-first table.
pub fn weekday_name<'a>(date: NaiveDate, table: &[&'a str; 7]) -> &'a str {
    table[date.weekday().num_days_from_monday() as usize]
}

/// File name for the diaries of one date.
pub fn day_file_name(date: NaiveDate) -> String {
    format!("{}.md", date.format("%Y-%m-%d"))
}

/// Write the Markdown for every diary of one date.
///
/// Several diaries on the same date share the file, in the order given,
/// separated by a horizontal rule.
pub fn write_day_markdown<W: Write>(
    writer: &mut W,
    date: NaiveDate,
    records: &[&DiaryRecord],
    options: MarkdownOptions,
    resolve_image: &dyn Fn(ImageId) -> String,
) -> io::Result<()> {
    writeln!(
        writer,
        "=={} {}==",
        date.format("%Y-%m-%d"),
        weekday_name(date, &MARKDOWN_WEEKDAYS)
    )?;
    writeln!(writer)?;

    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            writeln!(writer, "---")?;
            writeln!(writer)?;
        }

        if !record.title.trim().is_empty() {
            writeln!(writer, "# {}", record.title.trim())?;
            writeln!(writer)?;
        }

        let mut tags = Vec::new();
        if let Some(weather) = &record.weather {
            tags.push(format!("天气: {}", weather));
        }
        if let Some(mood) = &record.mood {
            tags.push(format!("心情: {}", mood));
        }
        if !tags.is_empty() {
            writeln!(writer, "**{}**", tags.join(" | "))?;
            writeln!(writer)?;
        }

        let body = if options.strip_indent {
            utils::strip_indent(&record.content)
        } else {
            record.content.clone()
        };
        let body = images::rewrite(&body, resolve_image);
        writeln!(writer, "{}", body)?;
    }

    Ok(())
}

/// Render one date file into `dir`, linking images into `pictures_dir`.
pub fn export_day(
    dir: &Path,
    pictures_dir: &Path,
    date: NaiveDate,
    records: &[&DiaryRecord],
    options: MarkdownOptions,
) -> io::Result<ProcessResult> {
    let resolve = |id: ImageId| {
        let ext = images::stored_extension(pictures_dir, id);
        format!("Pictures/{}", images::image_file_name(id, &ext))
    };
    let mut buf = Vec::new();
    write_day_markdown(&mut buf, date, records, options, &resolve)?;
    utils::write_atomic(&dir.join(day_file_name(date)), &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiaryId, UserId};
    use std::collections::BTreeSet;

    fn record(id: &str, title: &str, content: &str) -> DiaryRecord {
        DiaryRecord {
            id: DiaryId::new(id),
            author: UserId(1),
            created_date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            title: title.into(),
            content: content.into(),
            weather: Some("晴".into()),
            mood: Some("开心".into()),
            space: None,
            created_time: None,
            image_ids: images::extract_ids(content),
        }
    }

    fn jpg(id: ImageId) -> String {
        format!("Pictures/{}.jpg", id)
    }

    fn render(records: &[&DiaryRecord], strip_indent: bool) -> String {
        let mut buf = Vec::new();
        write_day_markdown(
            &mut buf,
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            records,
            MarkdownOptions { strip_indent },
            &jpg,
        )
        .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn renders_header_title_tags_and_body() {
        let r = record("1", "T", "    见 [图17]");
        assert_eq!(
            render(&[&r], true),
            "==2024-03-05 星期二==\n\n# T\n\n**天气: 晴 | 心情: 开心**\n\n见 ![图17](Pictures/17.jpg)\n"
        );
    }

    #[test]
    fn keeps_indent_when_asked() {
        let r = record("1", "", "    code");
        let out = render(&[&r], false);
        assert!(out.ends_with("\n    code\n"));
        assert!(!out.contains("# "));
    }

    #[test]
    fn same_date_diaries_share_the_file() {
        let a = record("1", "早", "a");
        let b = record("2", "晚", "b");
        let out = render(&[&a, &b], true);
        assert_eq!(out.matches("==2024-03-05").count(), 1);
        assert!(out.contains("a\n---\n\n# 晚"));
    }

    #[test]
    fn export_day_links_existing_extension_and_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let pics = dir.path().join("Pictures");
        std::fs::create_dir_all(&pics).unwrap();
        std::fs::write(pics.join("42.png"), b"x").unwrap();

        let r = record("1", "T", "[图17][图42]");
        assert_eq!(r.image_ids, BTreeSet::from([ImageId(17), ImageId(42)]));
        let date = r.created_date;
        let opts = MarkdownOptions { strip_indent: true };

        let first = export_day(dir.path(), &pics, date, &[&r], opts).unwrap();
        assert_eq!(first, ProcessResult::Created);
        let text = std::fs::read_to_string(dir.path().join("2024-03-05.md")).unwrap();
        assert!(text.contains("![图17](Pictures/17.jpg)![图42](Pictures/42.png)"));

        let again = export_day(dir.path(), &pics, date, &[&r], opts).unwrap();
        assert_eq!(again, ProcessResult::Unchanged);
    }
}
