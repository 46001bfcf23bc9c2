//! pagegrep command-line entry point

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pagegrep::config::{load_config, Config};
use pagegrep::graph::traverse;
use pagegrep::Crawler;
use tracing_subscriber::EnvFilter;

/// pagegrep: a concurrent grep-the-web crawler
///
/// Starts at the configured seed URL, greps every fetched page for the
/// configured pattern, and follows the links it finds until the link
/// budget is spent.
#[derive(Parser, Debug)]
#[command(name = "pagegrep")]
#[command(version)]
#[command(about = "Crawl outward from a seed page, grepping everything on the way", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate the config and show what would be crawled, then exit
    #[arg(long)]
    dry_run: bool,

    /// Re-parse everything even when the seed page was already done
    #[arg(long)]
    force: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("loading configuration from {}", cli.config.display());
    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!("failed to load configuration: {error}");
            return Err(error.into());
        }
    };

    if cli.dry_run {
        print_dry_run(&config);
        return Ok(());
    }
    run_crawl(config, cli.force)
}

/// Maps the verbosity flags onto an EnvFilter.
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("pagegrep=info,warn"),
            1 => EnvFilter::new("pagegrep=debug,info"),
            2 => EnvFilter::new("pagegrep=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_dry_run(config: &Config) {
    println!("=== pagegrep dry run ===\n");
    println!("Seed URL:     {}", config.crawler.seed_url);
    println!("Grep pattern: {}", config.crawler.grep_pattern);
    println!("Max links:    {}", config.crawler.max_links);
    println!("Threads:      {}", config.crawler.threads);
    println!("Max nodes:    {}", config.crawler.max_nodes);
    println!("User agent:   {}", config.http.user_agent);
    println!("Timeout:      {}s", config.http.timeout_secs);
    println!("\n✓ Configuration is valid");
}

fn run_crawl(config: Config, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let crawler = Crawler::new(config.http.clone());
    crawler.set_max_nodes(config.crawler.max_nodes);

    let pages = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&pages);
    crawler.set_on_single_node_scanned(move |_root, node| {
        seen.fetch_add(1, Ordering::SeqCst);
        node.grep_vars.with_state(|vars| {
            let text_hits = vars.match_text_vector().len();
            let url_hits = vars.match_url_vector().len();
            tracing::info!(
                url = vars.target_url(),
                status = node.grep_vars.response_code(),
                text_hits,
                url_hits,
                "scanned"
            );
            for &(begin, end) in vars.match_text_vector() {
                tracing::debug!(hit = &vars.page_content()[begin..end], "match");
            }
        });
    });
    crawler.set_on_level_spawned(|_root, head| {
        tracing::debug!(level = head.level(), "new level spawned");
    });
    crawler.set_on_exception(|message| {
        tracing::warn!("{message}");
    });

    let started = crawler.start_with_options(
        &config.crawler.seed_url,
        &config.crawler.grep_pattern,
        config.crawler.max_links,
        config.crawler.threads,
        force,
    );
    if !started {
        return Err("crawl did not start, see log for the reason".into());
    }

    // Block until the pool has drained; the timeout only guards against
    // a wedged network stack, each request already has its own.
    let budget_secs = config.http.timeout_secs.saturating_mul(
        (config.crawler.max_links as u64).max(1),
    );
    if !crawler.wait_until_idle(Duration::from_secs(budget_secs.clamp(30, 3600))) {
        tracing::warn!("crawl did not settle before the wait budget expired");
    }

    let mut nodes = 0usize;
    let mut matched_pages = 0usize;
    if let Some(root) = crawler.root() {
        traverse(root.node(), &mut |node| {
            nodes += 1;
            if node.grep_vars.with_state(|vars| !vars.match_text_vector().is_empty()) {
                matched_pages += 1;
            }
        });
    }
    println!(
        "crawl finished: {} pages scanned, {} nodes in tree, {} pages with matches, {} links followed",
        pages.load(Ordering::SeqCst),
        nodes,
        matched_pages,
        crawler.links_count()
    );

    crawler.clear();
    Ok(())
}
