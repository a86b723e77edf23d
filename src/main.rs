//! # Note Harness CLI (`nh`)
//!
//! Converts between markdown and ENML, patches notes through their markdown
//! form, and serves the same operations over HTTP.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nh to-enml <file.md>` | Markdown → ENML body (plus attachment summary on stderr) |
//! | `nh to-markdown <file.enml>` | ENML → markdown |
//! | `nh patch <file.enml> --find X --replace Y` | Find/replace through markdown, re-serialize |
//! | `nh tools` | List the built-in tools and their parameters |
//! | `nh serve` | Start the HTTP tool server |
//!
//! ## Examples
//!
//! ```bash
//! nh to-enml notes/today.md --out today.enml
//! nh to-markdown today.enml --attachments today.attachments.json
//! nh patch today.enml --find "Status: Pending" --replace "Status: Complete"
//! nh serve --config ./config/nh.toml
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use note_harness::commands::{self, PatchArgs};
use note_harness::config;
use note_harness::server;

/// Note Harness: markdown ⇄ ENML conversion with content-addressed attachments.
#[derive(Parser)]
#[command(name = "nh", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/nh.toml`. Conversion commands fall back to
    /// built-in defaults when the file does not exist; `serve` requires it.
    #[arg(long, global = true, default_value = "./config/nh.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a markdown file into an ENML note body.
    ///
    /// Local images and linked files are attached; relative paths resolve
    /// against `[conversion].base_dir`, or the input file's directory.
    ToEnml {
        /// Markdown file, or `-` for stdin.
        input: PathBuf,

        /// JSON array of attachments the note already has (`[{hash, mime, filename}]`).
        #[arg(long)]
        attachments: Option<PathBuf>,

        /// Write output here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Print the full result (body and attachments with base64 data) as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Convert an ENML note body into markdown.
    ToMarkdown {
        /// ENML file, or `-` for stdin.
        input: PathBuf,

        #[arg(long)]
        attachments: Option<PathBuf>,

        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Apply find/replace edits to an ENML note through its markdown form.
    ///
    /// Pairs of `--find`/`--replace` apply in order. Exits with status 1
    /// when nothing matched or the edit would leave the note empty.
    Patch {
        /// ENML file, or `-` for stdin.
        input: PathBuf,

        #[arg(long, required = true)]
        find: Vec<String>,

        #[arg(long, required = true)]
        replace: Vec<String>,

        /// Replace every occurrence instead of only the first.
        #[arg(long)]
        all: bool,

        #[arg(long)]
        attachments: Option<PathBuf>,

        #[arg(long)]
        out: Option<PathBuf>,

        /// Print the outcome and per-rule report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List the built-in tools.
    Tools,

    /// Start the HTTP tool server on `[server].bind`.
    Serve,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("note_harness={default_level},nh={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Serve = cli.command {
        let cfg = config::load_config(&cli.config)?;
        server::run_server(&cfg).await?;
        return Ok(());
    }

    // Use config if available, otherwise built-in defaults
    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        config::Config::minimal()
    };

    match cli.command {
        Commands::ToEnml {
            input,
            attachments,
            out,
            json,
        } => {
            commands::run_to_enml(&cfg, &input, attachments.as_deref(), out.as_deref(), json)?;
        }
        Commands::ToMarkdown {
            input,
            attachments,
            out,
        } => {
            commands::run_to_markdown(&input, attachments.as_deref(), out.as_deref())?;
        }
        Commands::Patch {
            input,
            find,
            replace,
            all,
            attachments,
            out,
            json,
        } => {
            let committed = commands::run_patch(
                &cfg,
                PatchArgs {
                    input,
                    find,
                    replace,
                    all,
                    attachments,
                    out,
                    json,
                },
            )?;
            if !committed {
                std::process::exit(1);
            }
        }
        Commands::Tools => {
            commands::run_list_tools()?;
        }
        Commands::Serve => {
            // Handled above (requires a config file)
            unreachable!()
        }
    }

    Ok(())
}
