use crate::client::{DiaryService, Session};
use crate::error::{ExportError, ExportResult, FetchError};
use crate::exporter::{self, MarkdownOptions};
use crate::images;
use crate::model::{
    DiaryId, DiaryIndex, DiaryRecord, DiarySummary, ImageId, MonthBucket, MonthKey, Scope, UserId,
};
use crate::utils::{self, DateRange, ExportConfig, ProcessResult, SortOrder, make_bar};
use chrono::NaiveDate;
use crossbeam_channel::{bounded, unbounded};
use indicatif::ProgressBar;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, info_span, warn};

/// Stages of one export run, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Authenticated,
    IndexFetched,
    Filtered,
    DetailsFetched,
    GroupedByMonth,
    MarkdownWritten,
    ImagesDownloaded,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Authenticated => "authenticated",
            Phase::IndexFetched => "index-fetched",
            Phase::Filtered => "filtered",
            Phase::DetailsFetched => "details-fetched",
            Phase::GroupedByMonth => "grouped-by-month",
            Phase::MarkdownWritten => "markdown-written",
            Phase::ImagesDownloaded => "images-downloaded",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Everything a run shares between its phases and workers.
pub struct RunContext<'a> {
    pub service: &'a dyn DiaryService,
    pub session: &'a Session,
    pub config: &'a ExportConfig,
}

/// An item the run gave up on, with the reason.
#[derive(Clone, Debug, Serialize)]
pub struct SkippedItem {
    pub kind: &'static str,
    pub id: String,
    pub month: Option<String>,
    pub reason: String,
}

/// Counts persisted to `export_stats.json`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunSummary {
    pub scope: Option<Scope>,
    pub author: Option<UserId>,
    pub range_start: Option<NaiveDate>,
    pub range_end: Option<NaiveDate>,
    pub diaries_listed: usize,
    pub diaries_in_range: usize,
    pub diaries_fetched: usize,
    pub diaries_skipped: usize,
    pub files_created: usize,
    pub files_updated: usize,
    pub files_unchanged: usize,
    pub files_failed: usize,
    /// Date files rewritten after download because an image's stored
    /// extension differed from the linked one.
    pub files_relinked: usize,
    pub images_requested: usize,
    pub images_downloaded: usize,
    pub images_already_present: usize,
    pub images_failed: usize,
    pub images_skipped_by_policy: bool,
    pub months: Vec<String>,
    pub export_time: String,
}

#[derive(Clone, Debug, Default)]
pub struct ExportReport {
    pub summary: RunSummary,
    pub skipped: Vec<SkippedItem>,
}

impl ExportReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

// ── Entry points ──────────────────────────────────────────────────────────────

/// Log in. The only fatal step before anything touches the disk.
pub fn login(service: &dyn DiaryService, email: &str, password: &str) -> ExportResult<Session> {
    let session = service.authenticate(email, password)?;
    info!(phase = %Phase::Authenticated, "session established");
    Ok(session)
}

pub fn fetch_index(
    service: &dyn DiaryService,
    session: &Session,
    scope: Scope,
) -> ExportResult<DiaryIndex> {
    let index = service
        .list_diaries(session, scope)
        .map_err(ExportError::Index)?;
    let first = index.summaries.iter().map(|s| s.created_date).min();
    let last = index.summaries.iter().map(|s| s.created_date).max();
    info!(
        phase = %Phase::IndexFetched,
        diaries = index.summaries.len(),
        images = index.image_ids.len(),
        author = %index.author,
        first = ?first,
        last = ?last,
        "diary index fetched"
    );
    Ok(index)
}

/// Full run: login, index, then [`run_export`].
pub fn execute(
    service: &dyn DiaryService,
    email: &str,
    password: &str,
    config: &ExportConfig,
) -> ExportResult<ExportReport> {
    let session = login(service, email, password)?;
    let index = fetch_index(service, &session, config.scope)?;
    let ctx = RunContext {
        service,
        session: &session,
        config,
    };
    run_export(&ctx, index)
}

/// Everything after the index: filter, fetch, group, write, download.
pub fn run_export(ctx: &RunContext, index: DiaryIndex) -> ExportResult<ExportReport> {
    let config = ctx.config;
    let span = info_span!("export", scope = config.scope.folder_name(), author = %index.author);
    let _guard = span.enter();

    let mut report = ExportReport::default();
    let summary = &mut report.summary;
    summary.scope = Some(config.scope);
    summary.author = Some(index.author);
    summary.range_start = Some(config.range.start);
    summary.range_end = Some(config.range.end);
    summary.diaries_listed = index.summaries.len();

    // Filtered
    let selected = filter_summaries(&index.summaries, config.range, config.order);
    info!(
        phase = %Phase::Filtered,
        in_range = selected.len(),
        start = %config.range.start,
        end = %config.range.end,
        "filtered diary index"
    );
    if selected.is_empty() {
        return Err(ExportError::NoDiariesInRange {
            start: config.range.start,
            end: config.range.end,
        });
    }
    summary.diaries_in_range = selected.len();

    let markdown_root = config.markdown_root();
    fs::create_dir_all(&markdown_root).map_err(|e| ExportError::io(&markdown_root, e))?;
    fs::create_dir_all(config.html_root()).map_err(|e| ExportError::io(config.html_root(), e))?;

    // DetailsFetched
    let (records, skipped) = fetch_details(ctx, index.author, &selected);
    report.summary.diaries_fetched = records.len();
    report.summary.diaries_skipped = skipped.len();
    report.skipped.extend(skipped);
    info!(
        phase = %Phase::DetailsFetched,
        fetched = records.len(),
        skipped = report.summary.diaries_skipped,
        "diary details fetched"
    );

    // GroupedByMonth
    let buckets = group_by_month(records, &markdown_root);
    report.summary.months = buckets.keys().map(|k| k.to_string()).collect();
    info!(
        phase = %Phase::GroupedByMonth,
        months = buckets.len(),
        images = buckets.values().map(|b| b.image_ids.len()).sum::<usize>(),
        "grouped by month"
    );

    // MarkdownWritten
    let options = MarkdownOptions {
        strip_indent: config.strip_indent,
    };
    for bucket in buckets.values() {
        write_bucket(bucket, options, &mut report);
    }
    info!(
        phase = %Phase::MarkdownWritten,
        created = report.summary.files_created,
        updated = report.summary.files_updated,
        unchanged = report.summary.files_unchanged,
        failed = report.summary.files_failed,
        "markdown written"
    );

    // ImagesDownloaded
    let default_range_only =
        config.images_only_for_default_range && config.range != config.default_range;
    if default_range_only {
        report.summary.images_skipped_by_policy = true;
        info!("range differs from the default range, skipping image download");
    } else {
        let relink = download_images(ctx, index.author, &buckets, &mut report);
        for (key, ids) in relink {
            if let Some(bucket) = buckets.get(&key) {
                relink_bucket(bucket, options, &ids, &mut report);
            }
        }
        info!(
            phase = %Phase::ImagesDownloaded,
            requested = report.summary.images_requested,
            downloaded = report.summary.images_downloaded,
            present = report.summary.images_already_present,
            failed = report.summary.images_failed,
            relinked = report.summary.files_relinked,
            "images downloaded"
        );
    }

    report.summary.export_time = chrono::Local::now().to_rfc3339();
    if config.write_summary {
        write_summary(&config.scope_dir(), &report);
    }

    if report.is_clean() {
        info!(phase = %Phase::Done, "export complete");
    } else {
        warn!(
            phase = %Phase::Done,
            skipped = report.skipped.len(),
            "export completed with skipped items"
        );
    }
    Ok(report)
}

// ── Phases ────────────────────────────────────────────────────────────────────

/// Inclusive date filter with a stable sort; ties keep index order.
pub fn filter_summaries(
    summaries: &[DiarySummary],
    range: DateRange,
    order: SortOrder,
) -> Vec<DiarySummary> {
    let mut selected: Vec<DiarySummary> = summaries
        .iter()
        .filter(|s| range.contains(s.created_date))
        .cloned()
        .collect();
    match order {
        SortOrder::Asc => selected.sort_by(|a, b| a.created_date.cmp(&b.created_date)),
        SortOrder::Desc => selected.sort_by(|a, b| b.created_date.cmp(&a.created_date)),
    }
    selected
}

fn fetch_details(
    ctx: &RunContext,
    author: UserId,
    selected: &[DiarySummary],
) -> (Vec<DiaryRecord>, Vec<SkippedItem>) {
    let pb = make_bar(selected.len() as u64, "diaries", ctx.config.quiet);
    let results = run_pool(selected, ctx.config.workers, &pb, |summary| {
        ctx.config.retry.run("diary detail", || {
            ctx.service
                .fetch_diary_detail(ctx.session, author, &summary.id)
        })
    });
    pb.finish_and_clear();

    let mut records = Vec::with_capacity(results.len());
    let mut skipped = Vec::new();
    for (summary, result) in selected.iter().zip(results) {
        match result {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(diary = %summary.id, date = %summary.created_date, error = %e, "skipping diary");
                skipped.push(skipped_diary(&summary.id, summary.created_date, &e));
            }
        }
    }
    (records, skipped)
}

fn skipped_diary(id: &DiaryId, date: NaiveDate, e: &FetchError) -> SkippedItem {
    SkippedItem {
        kind: "diary",
        id: id.to_string(),
        month: Some(MonthKey::of(date).to_string()),
        reason: e.to_string(),
    }
}

/// Assign each record to its calendar month. Records inside a bucket are
/// ordered by date; same-date records keep their input order.
pub fn group_by_month(
    records: Vec<DiaryRecord>,
    markdown_root: &Path,
) -> BTreeMap<MonthKey, MonthBucket> {
    let mut buckets: BTreeMap<MonthKey, MonthBucket> = BTreeMap::new();
    for record in records {
        let key = record.month();
        buckets
            .entry(key)
            .or_insert_with(|| MonthBucket::new(key, markdown_root))
            .push(record);
    }
    for bucket in buckets.values_mut() {
        bucket.records.sort_by_key(|r| r.created_date);
    }
    buckets
}

fn records_by_date(bucket: &MonthBucket) -> BTreeMap<NaiveDate, Vec<&DiaryRecord>> {
    let mut by_date: BTreeMap<NaiveDate, Vec<&DiaryRecord>> = BTreeMap::new();
    for record in &bucket.records {
        by_date.entry(record.created_date).or_default().push(record);
    }
    by_date
}

/// Write the date files of one bucket.
fn write_bucket(bucket: &MonthBucket, options: MarkdownOptions, report: &mut ExportReport) {
    let dirs = fs::create_dir_all(&bucket.markdown_dir)
        .and_then(|_| fs::create_dir_all(&bucket.pictures_dir));
    if let Err(e) = dirs {
        warn!(month = %bucket.key, error = %e, "cannot create month folder, skipping month");
        for record in &bucket.records {
            report.summary.files_failed += 1;
            report.skipped.push(SkippedItem {
                kind: "file",
                id: record.id.to_string(),
                month: Some(bucket.key.to_string()),
                reason: e.to_string(),
            });
        }
        return;
    }

    for (date, records) in records_by_date(bucket) {
        match exporter::export_day(&bucket.markdown_dir, &bucket.pictures_dir, date, &records, options) {
            Ok(ProcessResult::Created) => report.summary.files_created += 1,
            Ok(ProcessResult::Updated) => report.summary.files_updated += 1,
            Ok(ProcessResult::Unchanged) => report.summary.files_unchanged += 1,
            Err(e) => {
                warn!(date = %date, error = %e, "failed to write markdown");
                report.summary.files_failed += 1;
                report.skipped.push(SkippedItem {
                    kind: "file",
                    id: exporter::day_file_name(date),
                    month: Some(bucket.key.to_string()),
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// Rewrite only the dates whose diaries reference one of `images`. Files
/// already counted by [`write_bucket`] are not counted or skipped again.
fn relink_bucket(
    bucket: &MonthBucket,
    options: MarkdownOptions,
    images: &BTreeSet<ImageId>,
    report: &mut ExportReport,
) {
    for (date, records) in records_by_date(bucket) {
        if !records.iter().any(|r| !r.image_ids.is_disjoint(images)) {
            continue;
        }
        match exporter::export_day(&bucket.markdown_dir, &bucket.pictures_dir, date, &records, options) {
            Ok(ProcessResult::Unchanged) => {}
            Ok(_) => report.summary.files_relinked += 1,
            Err(e) => debug!(date = %date, error = %e, "relink rewrite failed"),
        }
    }
}

struct ImageTask<'a> {
    bucket: &'a MonthBucket,
    id: ImageId,
}

/// Download every missing image of every bucket. Returns, per month, the
/// images stored under an extension other than the one the Markdown links.
fn download_images(
    ctx: &RunContext,
    author: UserId,
    buckets: &BTreeMap<MonthKey, MonthBucket>,
    report: &mut ExportReport,
) -> BTreeMap<MonthKey, BTreeSet<ImageId>> {
    let mut tasks = Vec::new();
    for bucket in buckets.values() {
        for &id in &bucket.image_ids {
            report.summary.images_requested += 1;
            if images::find_existing(&bucket.pictures_dir, id).is_some() {
                report.summary.images_already_present += 1;
                debug!(image = %id, month = %bucket.key, "image already present");
            } else {
                tasks.push(ImageTask { bucket, id });
            }
        }
    }
    if tasks.is_empty() {
        return BTreeMap::new();
    }
    info!(images = tasks.len(), "downloading images");

    let count_downloaded = AtomicUsize::new(0);
    let count_failed = AtomicUsize::new(0);
    let pb = make_bar(tasks.len() as u64, "images", ctx.config.quiet);
    let results = run_pool(&tasks, ctx.config.image_workers, &pb, |task| {
        let result = download_one(ctx, author, task);
        match &result {
            Ok(_) => count_downloaded.fetch_add(1, Ordering::Relaxed),
            Err(_) => count_failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    });
    pb.finish_and_clear();
    report.summary.images_downloaded += count_downloaded.load(Ordering::Relaxed);
    report.summary.images_failed += count_failed.load(Ordering::Relaxed);

    let mut relink: BTreeMap<MonthKey, BTreeSet<ImageId>> = BTreeMap::new();
    for (task, result) in tasks.iter().zip(results) {
        match result {
            Ok(extension) if extension != images::DEFAULT_EXTENSION => {
                relink.entry(task.bucket.key).or_default().insert(task.id);
            }
            Ok(_) => {}
            Err(reason) => {
                warn!(image = %task.id, month = %task.bucket.key, error = %reason, "image download failed");
                report.skipped.push(SkippedItem {
                    kind: "image",
                    id: task.id.to_string(),
                    month: Some(task.bucket.key.to_string()),
                    reason,
                });
            }
        }
    }
    relink
}

fn download_one(ctx: &RunContext, author: UserId, task: &ImageTask) -> Result<&'static str, String> {
    let data = ctx
        .config
        .retry
        .run("image", || ctx.service.fetch_image(ctx.session, author, task.id))
        .map_err(|e| e.to_string())?;
    let extension = images::normalize_extension(data.extension);
    let path = task
        .bucket
        .pictures_dir
        .join(images::image_file_name(task.id, extension));
    utils::write_atomic(&path, &data.bytes)
        .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
    debug!(image = %task.id, path = %path.display(), "image saved");
    Ok(extension)
}

fn write_summary(scope_dir: &Path, report: &ExportReport) {
    #[derive(Serialize)]
    struct Stats<'a> {
        #[serde(flatten)]
        summary: &'a RunSummary,
        skipped: &'a [SkippedItem],
    }
    let path: PathBuf = scope_dir.join("export_stats.json");
    let stats = Stats {
        summary: &report.summary,
        skipped: &report.skipped,
    };
    let result = serde_json::to_vec_pretty(&stats)
        .map_err(std::io::Error::other)
        .and_then(|bytes| fs::write(&path, bytes));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "could not write run summary");
    }
}

// ── Worker pool ───────────────────────────────────────────────────────────────

/// Run `work` over `items` on `workers` threads. Results come back in input
/// order regardless of completion order.
fn run_pool<T, R, F>(items: &[T], workers: usize, pb: &ProgressBar, work: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let (tx, rx) = bounded::<usize>(64);
    let (done_tx, done_rx) = unbounded::<(usize, R)>();
    let n_workers = workers.clamp(1, items.len().max(1));

    std::thread::scope(|s| {
        for _ in 0..n_workers {
            let rx = rx.clone();
            let done_tx = done_tx.clone();
            let work = &work;

            s.spawn(move || {
                while let Ok(i) = rx.recv() {
                    let result = work(&items[i]);
                    pb.inc(1);
                    if done_tx.send((i, result)).is_err() {
                        break;
                    }
                }
            });
        }

        drop(rx);
        drop(done_tx);

        for i in 0..items.len() {
            if tx.send(i).is_err() {
                break;
            }
        }
        drop(tx);
    });

    let mut results: Vec<(usize, R)> = done_rx.into_iter().collect();
    results.sort_by_key(|(i, _)| *i);
    results.into_iter().map(|(_, r)| r).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, date: &str) -> DiarySummary {
        DiarySummary::new(DiaryId::new(id), date).unwrap()
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn filter_is_inclusive_and_stable() {
        let all = vec![
            summary("a", "2024-03-05"),
            summary("b", "2024-03-01"),
            summary("c", "2024-03-05"),
            summary("d", "2024-02-29"),
            summary("e", "2024-03-31"),
            summary("f", "2024-04-01"),
        ];
        let range = DateRange::new(d("2024-03-01"), d("2024-03-31"));

        let asc: Vec<_> = filter_summaries(&all, range, SortOrder::Asc)
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(asc, ["b", "a", "c", "e"]);

        let desc: Vec<_> = filter_summaries(&all, range, SortOrder::Desc)
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(desc, ["e", "a", "c", "b"]);
    }

    #[test]
    fn pool_preserves_input_order() {
        let items: Vec<u64> = (0..50).collect();
        let pb = ProgressBar::hidden();
        let out = run_pool(&items, 4, &pb, |&n| {
            std::thread::sleep(std::time::Duration::from_micros((50 - n) * 10));
            n * 2
        });
        assert_eq!(out, items.iter().map(|n| n * 2).collect::<Vec<_>>());
        assert!(run_pool(&[] as &[u64], 4, &pb, |&n| n).is_empty());
    }

    #[test]
    fn phases_display() {
        assert_eq!(Phase::MarkdownWritten.to_string(), "markdown-written");
    }
}
