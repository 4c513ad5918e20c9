//! Lighthead CLI - scrape a page through a headless browser

use clap::{error::ErrorKind, CommandFactory, Parser};
use lighthead::{
    validate_format, validate_max_redirects, validate_url, ChromiumEngine, EngineConfig,
    HtmlResult, OutputFormat, ScrapeError, ScrapeOptions, ScrapeRequest, ScrapeResult, Scraper,
    DEFAULT_MAX_REDIRECTS,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const EXAMPLES: &str = "\
Examples:
  lighthead https://example.com
  lighthead https://example.com --format markdown
  lighthead https://example.com --format text --output content.txt
  lighthead https://example.com/file.pdf --download
  lighthead https://example.com -v --format markdown
  lighthead https://example.com --cookies session.json
  lighthead https://example.com --no-redirects --max-redirects 5
  lighthead https://protected-site.com --no-stealth";

/// Lighthead - Lightweight headless web scraper
#[derive(Parser, Debug)]
#[command(name = "lighthead")]
#[command(version, about, long_about = None, after_help = EXAMPLES)]
struct Cli {
    /// URL to scrape
    url: Option<String>,

    /// Output format: html, markdown, text (default: html)
    #[arg(long, value_name = "FORMAT")]
    format: Option<String>,

    /// Save output to file
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Download binary files
    #[arg(long)]
    download: bool,

    /// Load/save cookies from/to JSON file
    #[arg(long, value_name = "FILE")]
    cookies: Option<PathBuf>,

    /// Don't follow HTTP redirects
    #[arg(long)]
    no_redirects: bool,

    /// Maximum number of redirects to follow (default: 10)
    #[arg(long, value_name = "N", allow_hyphen_values = true)]
    max_redirects: Option<String>,

    /// Disable stealth mode (bot detection evasion)
    #[arg(long)]
    no_stealth: bool,

    /// Enable verbose mode (show HTTP details)
    #[arg(short, long)]
    verbose: bool,
}

/// Validated invocation
#[derive(Debug)]
struct Settings {
    request: ScrapeRequest,
    format: OutputFormat,
    output: Option<PathBuf>,
    download: bool,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Scrape(#[from] ScrapeError),

    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Cli {
    fn into_settings(self) -> Result<Settings, ScrapeError> {
        let format = match &self.format {
            Some(raw) => validate_format(raw, false)?,
            None => OutputFormat::Html,
        };
        let max_redirects = match &self.max_redirects {
            Some(raw) => validate_max_redirects(raw, "max-redirects")?,
            None => DEFAULT_MAX_REDIRECTS,
        };
        let url = self
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or(ScrapeError::MissingUrl)?;
        validate_url(url)?;

        let mut options = ScrapeOptions::default()
            .verbose(self.verbose)
            .follow_redirects(!self.no_redirects)
            .max_redirects(max_redirects)
            .stealth(!self.no_stealth);
        if let Some(path) = self.cookies {
            options = options.cookie_file(path);
        }

        Ok(Settings {
            request: ScrapeRequest::new(url)?.with_options(options),
            format,
            output: self.output,
            download: self.download,
        })
    }
}

#[tokio::main]
async fn main() {
    if std::env::args_os().len() <= 1 {
        print_help();
        return;
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return;
        }
        Err(e) => fail(&CliError::Usage(clap_message(&e))),
    };

    init_tracing(cli.verbose);

    let settings = match cli.into_settings() {
        Ok(settings) => settings,
        Err(e) => fail(&e.into()),
    };

    if let Err(e) = run(settings).await {
        fail(&e);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "lighthead=info" } else { "lighthead=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

async fn run(settings: Settings) -> Result<(), CliError> {
    let options = settings.request.options();
    if options.verbose {
        print_summary(&settings);
    } else {
        eprintln!("Scraping: {}", settings.request.url());
    }

    let config = EngineConfig::default().with_env_overrides();
    let scraper = Scraper::new(ChromiumEngine::new(config.clone()), config);
    let result = scraper.scrape(&settings.request).await?;

    if options.verbose {
        eprintln!("\n=== SCRAPING COMPLETED ===");
        eprintln!("Result type: {}", result.kind());
        let response = result.response();
        eprintln!("Final status: {} {}", response.status, response.status_text);
    }

    match result {
        ScrapeResult::Html(page) => {
            let output = select_output(&page, settings.format);
            match &settings.output {
                Some(path) => {
                    write_file(path, output.as_bytes())?;
                    eprintln!("Saved to: {}", path.display());
                }
                None => writeln_safe(output),
            }
        }
        ScrapeResult::Binary(file) => {
            if settings.download {
                let name = local_filename(&file.filename);
                write_file(Path::new(&name), &file.buffer)?;
                eprintln!("Downloaded: {}", name);
            } else {
                eprintln!("Binary file detected. Use --download to save it.");
                eprintln!("Content-Type: {}", file.content_type);
                eprintln!("Size: {} bytes", file.buffer.len());
            }
        }
    }

    Ok(())
}

fn print_summary(settings: &Settings) {
    let options = settings.request.options();
    eprintln!("=== LIGHTHEAD VERBOSE MODE ===");
    eprintln!("Target URL: {}", settings.request.url());
    eprintln!("Output format: {}", settings.format);
    eprintln!(
        "Output file: {}",
        settings
            .output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "stdout".to_string())
    );
    eprintln!("Download mode: {}", settings.download);
    eprintln!("Follow redirects: {}", options.follow_redirects);
    eprintln!("Max redirects: {}", options.max_redirects);
    eprintln!(
        "Cookie file: {}",
        options
            .cookie_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    eprintln!("Stealth mode: {}", options.stealth);
    eprintln!("Verbose mode: enabled");
}

/// Representation of an HTML result to emit
fn select_output(page: &HtmlResult, format: OutputFormat) -> &str {
    match format {
        OutputFormat::Markdown => &page.markdown,
        OutputFormat::Text => &page.text,
        OutputFormat::Html | OutputFormat::Binary => &page.html,
    }
}

/// Strip directories from a server-supplied filename
fn local_filename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "download.bin".to_string())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), CliError> {
    std::fs::write(path, bytes).map_err(|source| CliError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn clap_message(e: &clap::Error) -> String {
    let rendered = e.to_string();
    let first = rendered.lines().next().unwrap_or_default();
    first.trim_start_matches("error: ").to_string()
}

fn print_help() {
    let mut cmd = Cli::command();
    if let Err(e) = cmd.print_help() {
        eprintln!("Error: {}", e);
    }
    println!();
}

fn fail(e: &CliError) -> ! {
    eprintln!("Error: {}", e);
    std::process::exit(1);
}

/// Write to stdout, exit silently on broken pipe
fn writeln_safe(s: &str) {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if let Err(e) = writeln!(handle, "{}", s) {
        if e.kind() == io::ErrorKind::BrokenPipe {
            std::process::exit(0);
        }
        eprintln!("Error writing to stdout: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("lighthead").chain(args.iter().copied()))
    }

    fn settings(args: &[&str]) -> Result<Settings, ScrapeError> {
        parse(args).unwrap().into_settings()
    }

    fn page() -> HtmlResult {
        HtmlResult {
            html: "<h1>T</h1>".to_string(),
            text: "T".to_string(),
            markdown: "# T".to_string(),
            url: "https://example.com/".to_string(),
            final_url: "https://example.com/".to_string(),
            redirect_chain: Vec::new(),
            response: Default::default(),
        }
    }

    #[test]
    fn test_defaults() {
        let s = settings(&["https://example.com"]).unwrap();
        let options = s.request.options();
        assert_eq!(s.format, OutputFormat::Html);
        assert!(options.follow_redirects);
        assert!(options.stealth);
        assert!(!options.verbose);
        assert_eq!(options.max_redirects, 10);
        assert!(options.cookie_file.is_none());
        assert!(s.output.is_none());
        assert!(!s.download);
    }

    #[test]
    fn test_all_flags() {
        let s = settings(&[
            "https://example.com",
            "--format",
            "MD",
            "--output",
            "out.md",
            "--download",
            "--cookies",
            "jar.json",
            "--no-redirects",
            "--max-redirects",
            "5",
            "--no-stealth",
            "-v",
        ])
        .unwrap();
        let options = s.request.options();
        assert_eq!(s.format, OutputFormat::Markdown);
        assert_eq!(s.output, Some(PathBuf::from("out.md")));
        assert!(s.download);
        assert_eq!(options.cookie_file, Some(PathBuf::from("jar.json")));
        assert!(!options.follow_redirects);
        assert_eq!(options.max_redirects, 5);
        assert!(!options.stealth);
        assert!(options.verbose);
    }

    #[test]
    fn test_url_after_flags() {
        let s = settings(&["--format", "text", "https://example.com/a"]).unwrap();
        assert_eq!(s.format, OutputFormat::Text);
        assert_eq!(s.request.url().as_str(), "https://example.com/a");
    }

    #[test]
    fn test_invalid_format() {
        let err = settings(&["https://example.com", "--format", "pdf"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid format: pdf. Valid formats are: html, markdown, md, text, txt"
        );
    }

    #[test]
    fn test_binary_format_rejected() {
        assert!(settings(&["https://example.com", "--format", "binary"]).is_err());
    }

    #[test]
    fn test_max_redirects_range() {
        let err = settings(&["https://example.com", "--max-redirects", "101"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "max-redirects must be a number between 0 and 100"
        );
        assert!(settings(&["https://example.com", "--max-redirects", "-1"]).is_err());
        let s = settings(&["https://example.com", "--max-redirects", "12.5"]).unwrap();
        assert_eq!(s.request.options().max_redirects, 12);
    }

    #[test]
    fn test_missing_url() {
        let err = settings(&["--verbose"]).unwrap_err();
        assert!(matches!(err, ScrapeError::MissingUrl));
        let err = settings(&[""]).unwrap_err();
        assert!(matches!(err, ScrapeError::MissingUrl));
    }

    #[test]
    fn test_bad_protocol() {
        let err = settings(&["ftp://example.com"]).unwrap_err();
        assert_eq!(err.to_string(), "URL must use HTTP or HTTPS protocol");
    }

    #[test]
    fn test_missing_flag_value() {
        let err = parse(&["https://example.com", "--format"]).unwrap_err();
        assert_ne!(err.kind(), ErrorKind::DisplayHelp);
        let message = clap_message(&err);
        assert!(message.contains("--format"));
        assert!(!message.starts_with("error:"));
    }

    #[test]
    fn test_help_flag() {
        let err = parse(&["--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        assert!(err.to_string().contains("--no-stealth"));
    }

    #[test]
    fn test_select_output() {
        let page = page();
        assert_eq!(select_output(&page, OutputFormat::Html), "<h1>T</h1>");
        assert_eq!(select_output(&page, OutputFormat::Markdown), "# T");
        assert_eq!(select_output(&page, OutputFormat::Text), "T");
    }

    #[test]
    fn test_local_filename() {
        assert_eq!(local_filename("report.pdf"), "report.pdf");
        assert_eq!(local_filename("../../etc/passwd"), "passwd");
        assert_eq!(local_filename(""), "download.bin");
    }

    #[test]
    fn test_write_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.txt");
        let err = write_file(&path, b"x").unwrap_err();
        assert!(err.to_string().starts_with("cannot write"));
    }
}
