use clap::{Parser, Subcommand, ValueEnum};
use gallery_store::config;
use gallery_store::gallery::{GalleryStore, OperatingMode, StoreContext};
use gallery_store::key::{GalleryId, PageIndex};
use gallery_store::locate::TemplateLocator;
use gallery_store::output::{self, DownloadSummary, PageOutcome};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

fn version_string() -> &'static str {
    let on_tag = env!("ON_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "gallery-store")]
#[command(about = "Two-tier page store for paginated image galleries")]
#[command(long_about = "\
Two-tier page store for paginated image galleries

Pages live in one of two places:

  cache       size-bounded LRU disk cache shared by all galleries (read mode)
  downloads/  one directory per gallery, never evicted (download mode)
    └── 42-Some Title/
        ├── 00000001.jpg
        └── 00000002.gif

A gallery starts in read mode. Passing --download (or running 'mode download')
creates its download directory; pages already in the cache are copied there
when they are looked up.

Set RUST_LOG=gallery_store=debug to trace each fetch.

Run 'gallery-store gen-config' to generate a documented store.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Path to store.toml
    #[arg(long, default_value = config::CONFIG_FILENAME, global = true)]
    config: PathBuf,

    /// Gallery id
    #[arg(long, global = true)]
    gallery: Option<u64>,

    /// Gallery title, used to name its download directory
    #[arg(long, default_value = "", global = true)]
    title: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch one page from a URL
    Fetch {
        /// 0-based page index
        index: PageIndex,
        url: String,
        #[arg(long)]
        referer: Option<String>,
        /// Store into the download directory instead of the cache
        #[arg(long)]
        download: bool,
    },
    /// Download a page range into the gallery's download directory
    Download {
        /// URL template with {gid}, {index} (0-based) and {page} (1-based)
        template: String,
        /// Number of pages
        #[arg(long)]
        pages: PageIndex,
        /// First page index
        #[arg(long, default_value_t = 0)]
        start: PageIndex,
        #[arg(long)]
        referer: Option<String>,
        /// Concurrent fetches
        #[arg(long, default_value_t = 4)]
        jobs: usize,
    },
    /// Report whether a page is stored
    Contains {
        index: PageIndex,
        /// Check as download mode (copies cached pages up)
        #[arg(long)]
        download: bool,
    },
    /// Remove a page from both tiers
    Remove { index: PageIndex },
    /// Copy a stored page to a file
    Export { index: PageIndex, destination: PathBuf },
    /// Print a page's stored extension
    Extension { index: PageIndex },
    /// Switch the gallery's mode (download creates its directory)
    Mode { mode: ModeArg },
    /// Show gallery and cache state
    Status,
    /// Print a stock store.toml with all options documented
    GenConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Read,
    Download,
}

impl From<ModeArg> for OperatingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Read => OperatingMode::Read,
            ModeArg::Download => OperatingMode::Download,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Command::GenConfig = cli.command {
        print!("{}", config::stock_config_toml());
        return Ok(());
    }

    let store_config = config::load_config(&cli.config)?;
    let ctx = StoreContext::open(&store_config)?;
    let gid = GalleryId(cli.gallery.ok_or("--gallery is required")?);
    let store = ctx.gallery(gid, cli.title.clone());

    match cli.command {
        Command::Fetch {
            index,
            url,
            referer,
            download,
        } => {
            if download {
                store.set_mode(OperatingMode::Download)?;
            }
            let outcome = fetch_one(&store, index, &url, referer.as_deref()).await;
            println!("{}", output::format_page_outcome(index, outcome));
            if outcome == PageOutcome::Failed {
                return Err(format!("fetching page {} failed", index).into());
            }
        }
        Command::Download {
            template,
            pages,
            start,
            referer,
            jobs,
        } => {
            store.set_mode(OperatingMode::Download)?;
            output::print_gallery_header(
                gid,
                store.title(),
                store.mode(),
                store.download_dir().as_deref(),
            );
            let mut locator = TemplateLocator::new(template);
            if let Some(referer) = referer {
                locator = locator.with_referer(referer);
            }
            let summary = download_range(Arc::new(store), Arc::new(locator), start, pages, jobs).await;
            println!();
            println!("{}", output::format_download_summary(&summary));
            if summary.failed > 0 {
                return Err(format!("{} pages failed", summary.failed).into());
            }
        }
        Command::Contains { index, download } => {
            if download {
                store.set_mode(OperatingMode::Download)?;
            }
            println!("{}", output::format_contains(index, store.contains(index).await));
        }
        Command::Remove { index } => {
            println!("{}", output::format_removal(index, store.remove(index).await));
        }
        Command::Export { index, destination } => {
            let saved = store.save_copy_to(index, &destination).await;
            println!("{}", output::format_export(index, &destination, saved));
        }
        Command::Extension { index } => {
            println!("{}", output::format_extension(index, store.extension(index).await));
        }
        Command::Mode { mode } => {
            store.set_mode(mode.into())?;
            output::print_gallery_header(
                gid,
                store.title(),
                store.mode(),
                store.download_dir().as_deref(),
            );
        }
        Command::Status => {
            output::print_gallery_header(
                gid,
                store.title(),
                store.mode(),
                store.download_dir().as_deref(),
            );
            let cache = ctx.transient();
            output::print_cache_status(cache.root(), cache.len(), cache.usage(), cache.max_bytes());
        }
        // Printed above, before any store is opened.
        Command::GenConfig => {}
    }

    Ok(())
}

async fn fetch_one(
    store: &GalleryStore,
    index: PageIndex,
    url: &str,
    referer: Option<&str>,
) -> PageOutcome {
    let mut on_progress = |expected: u64, received: u64, _delta: u64| {
        eprint!("\r{}", output::format_progress(index, expected, received));
        let _ = std::io::stderr().flush();
    };
    let ok = store
        .fetch_and_store(index, url, referer, &mut on_progress)
        .await;
    eprintln!();
    if ok {
        PageOutcome::Fetched(store.extension(index).await)
    } else {
        PageOutcome::Failed
    }
}

/// Fetch `count` pages starting at `start`, at most `jobs` at a time.
async fn download_range(
    store: Arc<GalleryStore>,
    locator: Arc<TemplateLocator>,
    start: PageIndex,
    count: PageIndex,
    jobs: usize,
) -> DownloadSummary {
    let semaphore = Arc::new(Semaphore::new(jobs.max(1)));
    let mut tasks = JoinSet::new();
    for index in start..start.saturating_add(count) {
        let store = Arc::clone(&store);
        let locator = Arc::clone(&locator);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (index, PageOutcome::Failed);
            };
            if store.contains(index).await {
                return (index, PageOutcome::AlreadyStored);
            }
            if store.fetch_page(locator.as_ref(), index, &mut |_, _, _| {}).await {
                (index, PageOutcome::Fetched(store.extension(index).await))
            } else {
                (index, PageOutcome::Failed)
            }
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => tracing::warn!("download task failed: {err}"),
        }
    }
    outcomes.sort_by_key(|(index, _)| *index);

    let mut summary = DownloadSummary::default();
    for (index, outcome) in outcomes {
        println!("{}", output::format_page_outcome(index, outcome));
        summary.record(outcome);
    }
    summary
}
