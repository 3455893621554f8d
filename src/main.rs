use chrono::{Datelike, Local, NaiveDate};
use clap::Parser;
use eyre::{Context, Result, eyre};
use nideriji_export::client::{ClientConfig, HttpDiaryClient, RetryPolicy};
use nideriji_export::error::ExportError;
use nideriji_export::model::{Scope, parse_date};
use nideriji_export::parallel::{self, RunContext};
use nideriji_export::renderer::{self, HTML_WEEKDAYS, RenderOptions};
use nideriji_export::utils::{DateRange, ExportConfig, SortOrder};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

/// Export nideriji diaries to Markdown and a static HTML page.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory that receives the `myself/` or `partner/` export tree.
    /// Defaults to the current directory if not set in config.
    #[arg(value_name = "OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Account email. Prompted for if omitted.
    #[arg(long, value_name = "EMAIL")]
    email: Option<String>,

    /// Export the paired partner's diaries instead of your own.
    #[arg(long)]
    partner: bool,

    /// First day to export (YYYY-MM-DD, or YYYY-MM for the whole month).
    #[arg(long, value_name = "DATE")]
    from: Option<String>,

    /// Last day to export (YYYY-MM-DD, or YYYY-MM for the whole month).
    #[arg(long, value_name = "DATE")]
    to: Option<String>,

    /// Export everything from the earliest diary up to today.
    #[arg(long, conflicts_with_all = ["from", "to"])]
    all: bool,

    /// Accept defaults instead of prompting.
    #[arg(short, long)]
    yes: bool,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/nideriji-export/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Order of diaries in the index and on the HTML page.
    #[arg(long, value_enum)]
    order: Option<SortOrder>,

    /// Concurrent diary detail requests.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Concurrent image downloads.
    #[arg(long, value_name = "N")]
    image_workers: Option<usize>,

    /// Keep 4-space indentation at the start of lines as written.
    #[arg(long)]
    keep_indent: bool,

    /// Skip rendering the HTML page.
    #[arg(long, conflicts_with = "render_only")]
    no_html: bool,

    /// Only render the existing Markdown tree to HTML; no network access.
    #[arg(long)]
    render_only: bool,

    /// Also append the log to this file.
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Log debug details.
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors, hide progress bars.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    email: Option<String>,
    password: Option<String>,
    output_dir: Option<PathBuf>,
    partner: Option<bool>,
    workers: Option<usize>,
    image_workers: Option<usize>,
    timeout_secs: Option<u64>,
    request_interval_ms: Option<u64>,
    retries: Option<u32>,
    order: Option<SortOrder>,
    strip_indent: Option<bool>,
    images_only_for_default_range: Option<bool>,
    default_range_days: Option<u64>,
    write_summary: Option<bool>,
    api_base: Option<Url>,
    image_base: Option<Url>,
    template_dir: Option<PathBuf>,
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        // Search: XDG/OS config dir, then nothing
        dirs::config_dir()
            .map(|d| d.join("nideriji-export/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn init_logging(verbose: bool, quiet: bool, log_file: Option<&Path>) -> Result<()> {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match log_file {
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .wrap_err_with(|| format!("Failed to open log file: {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| eyre!("Failed to initialise logging: {}", e))
}

// ── Prompts ───────────────────────────────────────────────────────────────────

struct Prompter {
    interactive: bool,
}

impl Prompter {
    /// Ask for a line; empty input (or non-interactive mode) yields `default`.
    fn ask(&self, label: &str, default: &str) -> Result<String> {
        if !self.interactive {
            return Ok(default.to_string());
        }
        if default.is_empty() {
            eprint!("{}: ", label);
        } else {
            eprint!("{} [{}]: ", label, default);
        }
        io::stderr().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        let answer = line.trim();
        Ok(if answer.is_empty() {
            default.to_string()
        } else {
            answer.to_string()
        })
    }

    fn password(&self) -> Result<String> {
        if !self.interactive {
            return Err(eyre!(
                "No password given. Set NIDERIJI_PASSWORD or `password` in config.toml."
            ));
        }
        rpassword::prompt_password("密码: ").wrap_err("Failed to read password")
    }
}

/// Parse a range bound. `YYYY-MM` means the first (or, for an end bound,
/// the last) day of that month.
fn parse_bound(input: &str, is_end: bool) -> Result<NaiveDate> {
    let input = input.trim();
    if let Some(date) = parse_date(input) {
        return Ok(date);
    }
    let first = NaiveDate::parse_from_str(&format!("{}-01", input), "%Y-%m-%d")
        .map_err(|_| eyre!("Invalid date {:?}, expected YYYY-MM-DD or YYYY-MM", input))?;
    if !is_end {
        return Ok(first);
    }
    let (y, m) = if first.month() == 12 {
        (first.year() + 1, 1)
    } else {
        (first.year(), first.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1)
        .and_then(|d| d.pred_opt())
        .ok_or_else(|| eyre!("Date out of range: {:?}", input))
}

fn resolve_bound(
    flag: Option<&str>,
    prompter: &Prompter,
    label: &str,
    default: NaiveDate,
    is_end: bool,
) -> Result<NaiveDate> {
    let answer = match flag {
        Some(v) => v.to_string(),
        None => prompter.ask(label, &default.format("%Y-%m-%d").to_string())?,
    };
    parse_bound(&answer, is_end)
}

// ── Main ──────────────────────────────────────────────────────────────────────

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.log_file.as_deref())?;

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    let interactive = !cli.yes && io::stdin().is_terminal();
    let prompter = Prompter { interactive };
    let today = Local::now().date_naive();

    // 2. Resolve scope (CLI > Config > Prompt)
    let scope = if cli.partner || file_cfg.partner == Some(true) {
        Scope::Partner
    } else if cli.render_only || file_cfg.partner == Some(false) {
        Scope::Myself
    } else {
        match prompter.ask("输入1保存自己的日记，输入2保存搭档的日记", "1")?.as_str() {
            "2" => Scope::Partner,
            _ => Scope::Myself,
        }
    };

    // 3. Build the export config (CLI > Config > Default)
    let default_range = DateRange::trailing(today, file_cfg.default_range_days.unwrap_or(3));
    let mut config = ExportConfig {
        output_dir: cli
            .output_dir
            .or(file_cfg.output_dir)
            .unwrap_or_else(|| PathBuf::from(".")),
        scope,
        range: default_range,
        default_range,
        order: cli.order.or(file_cfg.order).unwrap_or_default(),
        workers: cli.workers.or(file_cfg.workers).unwrap_or(5).max(1),
        image_workers: cli.image_workers.or(file_cfg.image_workers).unwrap_or(3).max(1),
        retry: RetryPolicy {
            retries: file_cfg.retries.unwrap_or(2),
            ..RetryPolicy::default()
        },
        strip_indent: !cli.keep_indent && file_cfg.strip_indent.unwrap_or(true),
        images_only_for_default_range: file_cfg.images_only_for_default_range.unwrap_or(false),
        write_summary: file_cfg.write_summary.unwrap_or(true),
        quiet: cli.quiet,
    };
    let render_options = RenderOptions {
        markdown_root: config.markdown_root(),
        template_dir: file_cfg
            .template_dir
            .clone()
            .unwrap_or_else(|| config.html_root()),
        output_dir: config.html_root().join("output"),
        order: config.order,
        weekdays: HTML_WEEKDAYS,
    };

    if cli.render_only {
        renderer::render_site(&render_options).wrap_err("HTML rendering failed")?;
        return Ok(ExitCode::SUCCESS);
    }

    // 4. Credentials (CLI > Config > Env > Prompt)
    let email = match cli.email.or(file_cfg.email) {
        Some(e) => e,
        None if interactive => prompter.ask("邮箱", "")?,
        None => return Err(eyre!("No email given. Use --email or set `email` in config.toml.")),
    };
    let password = match file_cfg
        .password
        .or_else(|| std::env::var("NIDERIJI_PASSWORD").ok())
    {
        Some(p) => p,
        None => prompter.password()?,
    };

    let defaults = ClientConfig::default();
    let client = HttpDiaryClient::new(ClientConfig {
        api_base: file_cfg.api_base.unwrap_or(defaults.api_base),
        image_base: file_cfg.image_base.unwrap_or(defaults.image_base),
        timeout: Duration::from_secs(file_cfg.timeout_secs.unwrap_or(15)),
        request_interval: Duration::from_millis(file_cfg.request_interval_ms.unwrap_or(100)),
    })
    .wrap_err("Failed to build HTTP client")?;

    // 5. Authenticate and read the index
    let session = match parallel::login(&client, &email, &password) {
        Ok(s) => s,
        Err(e) => {
            error!("{}", e);
            return Ok(ExitCode::from(1));
        }
    };
    let index = parallel::fetch_index(&client, &session, scope)?;

    // 6. Resolve the date range, defaults depend on the index
    config.range = if cli.all {
        let first = index
            .summaries
            .iter()
            .map(|s| s.created_date)
            .min()
            .unwrap_or(today);
        DateRange::new(first, today)
    } else {
        let start = resolve_bound(
            cli.from.as_deref(),
            &prompter,
            "起始日期 (YYYY-MM-DD 或 YYYY-MM)",
            default_range.start,
            false,
        )?;
        let end = resolve_bound(
            cli.to.as_deref(),
            &prompter,
            "结束日期 (YYYY-MM-DD 或 YYYY-MM)",
            default_range.end,
            true,
        )?;
        DateRange::new(start, end)
    };

    // 7. Run the business logic
    let ctx = RunContext {
        service: &client,
        session: &session,
        config: &config,
    };
    let report = match parallel::run_export(&ctx, index) {
        Ok(r) => r,
        Err(e @ ExportError::NoDiariesInRange { .. }) => {
            warn!("{}", e);
            return Ok(ExitCode::from(2));
        }
        Err(e) => return Err(e).wrap_err("Export failed"),
    };

    if !cli.no_html {
        renderer::render_site(&render_options).wrap_err("HTML rendering failed")?;
    }

    let s = &report.summary;
    if report.is_clean() {
        info!(
            diaries = s.diaries_fetched,
            images = s.images_downloaded,
            months = s.months.len(),
            "completed"
        );
    } else {
        warn!(
            diaries = s.diaries_fetched,
            images = s.images_downloaded,
            skipped = report.skipped.len(),
            "completed with {} skipped item(s)",
            report.skipped.len()
        );
    }

    Ok(ExitCode::SUCCESS)
}
