use std::path::{Component, PathBuf};

use clap::{
    CommandFactory,
    Parser,
    Subcommand,
    ValueEnum,
    builder::TypedValueParser,
};
use clap_complete::Shell;

use crate::{
    clip::{DEFAULT_MODEL_ID, DEFAULT_REVISION, DeviceChoice},
    scan::DEFAULT_SAVE_EVERY,
    search::{DEFAULT_PREFIX, DEFAULT_RESULTS},
};

#[derive(Debug, Parser)]
#[command(
    name = "clipseek",
    about = "Search a local image folder by text or image similarity"
)]
pub struct Cli {
    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Rank the images of a folder against a text or image query
    Search(SearchArgs),
    /// Embed every image of a folder into the cache without searching
    Index(IndexArgs),
    /// Show what the feature cache holds
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

/// What to do when the cache file cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CorruptPolicy {
    /// Stop with an error
    #[default]
    Fail,
    /// Start over with an empty cache
    Fresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum PolicyArg {
    /// Softmax of the query against the auxiliary vocabulary
    #[default]
    Softmax,
    /// Raw cosine similarity with the query
    Cosine,
}

// -- Shared argument groups --

#[derive(Debug, Clone, clap::Args)]
pub struct SnapshotArgs {
    /// Folder holding the images to search
    #[arg(short, long, default_value = "images")]
    pub folder: PathBuf,

    /// Feature cache file [default: <folder>_features.redb]
    #[arg(short, long)]
    pub dict: Option<PathBuf>,
}

impl SnapshotArgs {
    /// Resolve the cache file, deriving it from the folder name when unset.
    pub fn snapshot_path(&self) -> PathBuf {
        if let Some(dict) = &self.dict {
            return dict.clone();
        }
        // Normalizes away trailing separators and `.` components.
        let folder: PathBuf = self
            .folder
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();
        let name = folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "images".to_string());
        folder.with_file_name(format!("{name}_features.redb"))
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct ScanArgs {
    /// Ignore any existing cache and start a new one
    #[arg(long)]
    pub initiate: bool,

    /// Save the cache after this many new embeddings
    #[arg(long, default_value_t = DEFAULT_SAVE_EVERY, value_parser = clap::value_parser!(u64).range(1..).map(|v| v as usize))]
    pub save_every: usize,

    /// Concurrent image embeddings
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..).map(|v| v as usize))]
    pub jobs: usize,

    /// Give up on a single image after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// What to do when the cache file is unreadable
    #[arg(long, value_enum, default_value_t = CorruptPolicy::Fail)]
    pub on_corrupt: CorruptPolicy,

    /// Do not draw a progress bar
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Debug, Clone, clap::Args)]
pub struct ModelArgs {
    /// CLIP model ID on the Hugging Face hub
    #[arg(long, env = "CLIPSEEK_MODEL", default_value = DEFAULT_MODEL_ID)]
    pub model: String,

    /// Model revision (branch, tag or ref)
    #[arg(long, default_value = DEFAULT_REVISION)]
    pub revision: String,

    /// Compute device
    #[arg(long, value_enum, env = "CLIPSEEK_DEVICE", default_value_t = DeviceChoice::Auto)]
    pub device: DeviceChoice,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// Text to search for
    #[arg(short, long)]
    pub text: Option<String>,

    /// Image to search with
    #[arg(short, long)]
    pub image: Option<PathBuf>,

    /// Number of results to return
    #[arg(short, long, default_value_t = DEFAULT_RESULTS)]
    pub results: usize,

    /// Prefix added to the query text and every vocabulary label
    #[arg(long, default_value = DEFAULT_PREFIX)]
    pub format: String,

    /// Scoring policy
    #[arg(long, value_enum, default_value_t = PolicyArg::Softmax)]
    pub policy: PolicyArg,

    /// Softmax temperature
    #[arg(long, default_value_t = 1.0)]
    pub temperature: f32,

    /// Newline-separated auxiliary labels [default: CIFAR-100 classes]
    #[arg(long)]
    pub vocabulary: Option<PathBuf>,

    /// Copy the results into the copy folder
    #[arg(short, long)]
    pub copy: bool,

    /// Empty the copy folder before copying
    #[arg(long)]
    pub copy_remove: bool,

    /// Where results are copied to
    #[arg(long, default_value = "results")]
    pub copy_folder: PathBuf,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub snapshot: SnapshotArgs,

    #[command(flatten)]
    pub scan: ScanArgs,

    #[command(flatten)]
    pub model: ModelArgs,
}

// -- Index --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Output the scan report as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub snapshot: SnapshotArgs,

    #[command(flatten)]
    pub scan: ScanArgs,

    #[command(flatten)]
    pub model: ModelArgs,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub snapshot: SnapshotArgs,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "clipseek",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_search_defaults() {
        let cli = Cli::parse_from(["clipseek", "search", "-t", "dog"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.text.as_deref(), Some("dog"));
                assert!(args.image.is_none());
                assert_eq!(args.results, 5);
                assert_eq!(args.format, "a picture of ");
                assert_eq!(args.policy, PolicyArg::Softmax);
                assert_eq!(args.temperature, 1.0);
                assert!(!args.copy);
                assert!(!args.copy_remove);
                assert_eq!(args.copy_folder, PathBuf::from("results"));
                assert_eq!(args.snapshot.folder, PathBuf::from("images"));
                assert_eq!(args.scan.save_every, 1000);
                assert_eq!(args.scan.jobs, 1);
                assert_eq!(args.scan.on_corrupt, CorruptPolicy::Fail);
                assert!(!args.scan.initiate);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parse_index_with_options() {
        let cli = Cli::parse_from([
            "clipseek",
            "index",
            "-f",
            "photos",
            "--save-every",
            "10",
            "--jobs",
            "4",
            "--on-corrupt",
            "fresh",
        ]);
        match cli.command {
            Command::Index(args) => {
                assert_eq!(args.snapshot.folder, PathBuf::from("photos"));
                assert_eq!(args.scan.save_every, 10);
                assert_eq!(args.scan.jobs, 4);
                assert_eq!(args.scan.on_corrupt, CorruptPolicy::Fresh);
            }
            _ => panic!("expected index command"),
        }
    }

    #[test]
    fn zero_save_every_is_rejected() {
        let parsed =
            Cli::try_parse_from(["clipseek", "index", "--save-every", "0"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn snapshot_path_defaults_next_to_folder() {
        let args = SnapshotArgs {
            folder: PathBuf::from("data/photos/"),
            dict: None,
        };
        assert_eq!(
            args.snapshot_path(),
            PathBuf::from("data/photos_features.redb")
        );

        let args = SnapshotArgs {
            folder: PathBuf::from("images"),
            dict: None,
        };
        assert_eq!(args.snapshot_path(), PathBuf::from("images_features.redb"));
    }

    #[test]
    fn explicit_dict_wins() {
        let args = SnapshotArgs {
            folder: PathBuf::from("images"),
            dict: Some(PathBuf::from("/tmp/cache.redb")),
        };
        assert_eq!(args.snapshot_path(), PathBuf::from("/tmp/cache.redb"));
    }
}
