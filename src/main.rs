// lv-media: index a media tree, serve thumbnails and byte ranges from it.
// Usage: lv-media [--media-dir DIR] <command>

const VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_HASH: &str = env!("GIT_HASH");

mod cli;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::debug;

use lv_media::cache::ArtifactKind;
use lv_media::classify::FileType;
use lv_media::config::Config;
use lv_media::index::{Filter, ListQuery, SortField, SortOrder};
use lv_media::Library;

#[derive(Parser)]
#[command(name = "lv-media", version, about = "Media index, thumbnail cache and range streaming")]
struct Args {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    debug: bool,
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Media root (overrides config)
    #[arg(long, global = true)]
    media_dir: Option<PathBuf>,
    /// Index database path (overrides config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scan pass and report what changed
    Scan,
    /// Scan at startup, then on an interval and on filesystem changes
    Watch,
    /// List a folder
    Ls {
        /// Folder relative to the media root
        #[arg(default_value = "")]
        folder: String,
        /// name | date | size | type
        #[arg(long, default_value = "name")]
        sort: SortField,
        #[arg(long)]
        desc: bool,
        /// folder | image | video | playlist | other
        #[arg(long = "type")]
        file_type: Option<FileType>,
        #[arg(long)]
        favorites: bool,
        #[arg(long)]
        tag: Option<String>,
        /// Case-insensitive name substring
        #[arg(long)]
        name: Option<String>,
        #[arg(short, long)]
        recursive: bool,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Show one entry
    Show {
        path: String,
        #[arg(long)]
        json: bool,
    },
    /// Print a random indexed file
    Random {
        #[arg(long)]
        favorites: bool,
    },
    /// Mark files as favorites
    Fav {
        #[arg(required = true)]
        paths: Vec<String>,
        /// Clear instead of set
        #[arg(long, conflicts_with = "toggle")]
        off: bool,
        #[arg(long)]
        toggle: bool,
    },
    /// Manage tags
    Tag {
        #[command(subcommand)]
        command: TagCommand,
    },
    /// Aggregate counts
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Write a derived thumbnail to a file
    Thumb {
        path: String,
        #[arg(short, long)]
        output: PathBuf,
        /// thumbnail | shadow
        #[arg(long, default_value = "thumbnail")]
        kind: ArtifactKind,
    },
    /// Write a file, or a byte range of it, to stdout
    Cat {
        path: String,
        /// e.g. 0-99, 500-, -200
        #[arg(long)]
        range: Option<String>,
    },
}

#[derive(Subcommand)]
enum TagCommand {
    /// Tag one or more files
    Add {
        tag: String,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Untag one or more files
    Rm {
        tag: String,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Delete a tag everywhere (files stay)
    Delete { tag: String },
    /// List tags with usage counts
    List {
        #[arg(long)]
        json: bool,
    },
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => Config::default(),
    };
    if let Some(dir) = &args.media_dir {
        config.media_dir = dir.clone();
    }
    if let Some(db) = &args.db {
        config.db_path = db.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    lv_media::logging::init(args.debug);
    debug!("lv-media {} ({})", VERSION, GIT_HASH);

    let config = load_config(&args)?;
    debug!("media root {}, index {}", config.media_dir.display(), config.db_path.display());
    let lib = Library::open(config).context("opening library")?;

    match args.command {
        Command::Scan => cli::scan(&lib),
        Command::Watch => cli::watch(&lib),
        Command::Ls {
            folder,
            sort,
            desc,
            file_type,
            favorites,
            tag,
            name,
            recursive,
            offset,
            limit,
            json,
        } => {
            let query = ListQuery {
                folder,
                sort,
                order: if desc { SortOrder::Desc } else { SortOrder::Asc },
                filter: Filter {
                    file_type,
                    favorites_only: favorites,
                    tag,
                    name_contains: name,
                },
                recursive,
                offset,
                limit,
            };
            cli::ls(&lib, &query, json)
        }
        Command::Show { path, json } => cli::show(&lib, &path, json),
        Command::Random { favorites } => cli::random(&lib, favorites),
        Command::Fav { paths, off, toggle } => cli::fav(&lib, &paths, off, toggle),
        Command::Tag { command } => match command {
            TagCommand::Add { tag, paths } => cli::tag(&lib, &paths, &tag, true),
            TagCommand::Rm { tag, paths } => cli::tag(&lib, &paths, &tag, false),
            TagCommand::Delete { tag } => cli::tag_delete(&lib, &tag),
            TagCommand::List { json } => cli::tag_list(&lib, json),
        },
        Command::Stats { json } => cli::stats(&lib, json),
        Command::Thumb { path, output, kind } => cli::thumb(&lib, &path, kind, &output).await,
        Command::Cat { path, range } => cli::cat(&lib, &path, range.as_deref()).await,
    }
}
