//! SwiftPage CLI - rewrite pages and serve optimized resources against a
//! live origin.

use clap::{Parser, Subcommand};
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod commands;
mod fetcher;
mod logging;
mod output;

use commands::{OptionsFormat, Overrides};
use fetcher::ReqwestFetcher;
use logging::LogFormat;
use output::StreamWriter;

/// SwiftPage - HTML and resource optimization
#[derive(Parser, Debug)]
#[command(name = "swiftpage")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    /// Options file (YAML, TOML or JSON); `SWIFTPAGE__*` variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Comma-separated filters to enable instead of the configured ones
    #[arg(long, value_delimiter = ',', global = true)]
    filters: Option<Vec<String>>,

    /// Rewrite deadline in milliseconds
    #[arg(long, global = true)]
    deadline_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch a page through the rewriter and print the result
    Rewrite {
        /// Page URL
        url: String,
        /// Number of requests; background rewrites finish between them
        #[arg(short, long, default_value_t = 1)]
        passes: u32,
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Serve a rewritten resource URL
    Serve {
        /// Rewritten resource URL
        url: String,
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Print the effective options
    Options {
        /// Output format
        #[arg(long, value_enum, default_value_t = OptionsFormat::Yaml)]
        format: OptionsFormat,
    },

    /// Show version information
    Version,
}

#[derive(clap::Args, Debug)]
struct RequestArgs {
    /// Extra request header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", value_parser = commands::parse_header)]
    headers: Vec<(String, String)>,

    /// User-Agent sent with the request
    #[arg(short = 'A', long)]
    user_agent: Option<String>,

    /// Print the status line and response headers before the body
    #[arg(short, long)]
    include: bool,

    /// Origin fetch timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = Overrides {
        filters: cli.filters,
        deadline_ms: cli.deadline_ms,
    };
    let options = commands::load_options(cli.config.as_deref(), &overrides)?;

    match cli.command {
        Commands::Rewrite {
            url,
            passes,
            request,
        } => {
            let fetcher = ReqwestFetcher::new(Duration::from_secs(request.timeout_secs))?;
            let proxy = commands::build_proxy(options, Arc::new(fetcher))?;
            let headers = commands::request_headers(&request.headers, request.user_agent.as_deref());
            let mut out = StreamWriter::new(BufWriter::new(std::io::stdout()), request.include);
            commands::rewrite(&proxy, &url, &headers, passes, &mut out).await?;
            out.finish()?;
            Ok(())
        }
        Commands::Serve { url, request } => {
            let fetcher = ReqwestFetcher::new(Duration::from_secs(request.timeout_secs))?;
            let proxy = commands::build_proxy(options, Arc::new(fetcher))?;
            let headers = commands::request_headers(&request.headers, request.user_agent.as_deref());
            let mut out = StreamWriter::new(BufWriter::new(std::io::stdout()), request.include);
            commands::serve(&proxy, &url, &headers, &mut out).await?;
            out.finish()?;
            Ok(())
        }
        Commands::Options { format } => {
            println!("{}", commands::render_options(&options, format)?);
            Ok(())
        }
        Commands::Version => {
            println!("swiftpage {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(logging::level_for(cli.verbose), cli.log_format);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
