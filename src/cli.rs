//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

use marketcap_core::DatasetFormat;

/// Collect daily market cap rankings and publish them as validated datasets.
///
/// Pages through the complete ranking under the upstream quota, writes a raw
/// snapshot, and builds embedded-database, columnar and CSV artifacts from it.
#[derive(Parser, Debug)]
#[command(name = "marketcap-rank")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/marketcap-rank/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

/// Settings that take precedence over the environment and config file.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct Overrides {
    /// Upstream API key (falls back to COINGECKO_API_KEY)
    #[arg(long, global = true, value_name = "KEY")]
    pub api_key: Option<String>,

    /// Raw snapshot directory
    #[arg(long, global = true, value_name = "DIR")]
    pub raw_dir: Option<PathBuf>,

    /// Published artifact directory
    #[arg(long, global = true, value_name = "DIR")]
    pub processed_dir: Option<PathBuf>,

    /// Checkpoint directory
    #[arg(long, global = true, value_name = "DIR")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Hard ceiling on pages per collection run (1-10000)
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..=10_000))]
    pub max_pages: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Collect a snapshot, then build all three artifact formats
    Run(CollectArgs),

    /// Collect a raw snapshot
    Collect(CollectArgs),

    /// Build an artifact from a raw snapshot
    Build {
        /// Raw snapshot JSON file
        raw: PathBuf,

        /// Artifact format
        #[arg(short, long, value_enum, default_value_t = FormatArg::Sqlite)]
        format: FormatArg,
    },

    /// Re-check a published artifact
    Validate {
        /// Artifact file or directory
        artifact: PathBuf,

        /// Artifact format (inferred from the extension when omitted)
        #[arg(short, long, value_enum)]
        format: Option<FormatArg>,
    },

    /// Print the canonical schema
    Schema {
        #[arg(short, long, value_enum, default_value_t = SchemaFormat::Json)]
        format: SchemaFormat,
    },

    /// Inspect or remove collection checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(ClapArgs, Debug, Clone)]
pub struct CollectArgs {
    /// Snapshot date, YYYY-MM-DD (default: today, UTC)
    #[arg(short, long, value_parser = parse_date)]
    pub date: Option<NaiveDate>,

    /// Start from page 1 even when a checkpoint exists
    #[arg(long)]
    pub no_resume: bool,
}

#[derive(Subcommand, Debug)]
pub enum CheckpointAction {
    /// List dates with a stored checkpoint
    List,
    /// Delete the checkpoint (and partial records) for a date
    Delete {
        #[arg(value_parser = parse_date)]
        date: NaiveDate,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatArg {
    Sqlite,
    Parquet,
    Csv,
}

impl From<FormatArg> for DatasetFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Sqlite => Self::Sqlite,
            FormatArg::Parquet => Self::Parquet,
            FormatArg::Csv => Self::Csv,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFormat {
    /// JSON-Schema document
    Json,
    /// SQL table and index DDL
    Ddl,
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD, got {value:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_collect_defaults() {
        let args = Args::try_parse_from(["marketcap-rank", "collect"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        let Command::Collect(collect) = args.command else {
            panic!("expected collect");
        };
        assert_eq!(collect.date, None);
        assert!(!collect.no_resume);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["marketcap-rank", "-vv", "schema"]).unwrap();
        assert_eq!(args.verbose, 2);

        let args = Args::try_parse_from(["marketcap-rank", "schema", "--verbose"]).unwrap();
        assert_eq!(args.verbose, 1);
    }

    #[test]
    fn test_cli_date_parsing() {
        let args =
            Args::try_parse_from(["marketcap-rank", "run", "--date", "2025-11-23"]).unwrap();
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.date, NaiveDate::from_ymd_opt(2025, 11, 23));

        let result = Args::try_parse_from(["marketcap-rank", "collect", "--date", "23/11/2025"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ValueValidation
        );
    }

    #[test]
    fn test_cli_build_format() {
        let args = Args::try_parse_from(["marketcap-rank", "build", "raw.json"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Build {
                format: FormatArg::Sqlite,
                ..
            }
        ));

        let args =
            Args::try_parse_from(["marketcap-rank", "build", "raw.json", "-f", "csv"]).unwrap();
        let Command::Build { raw, format } = args.command else {
            panic!("expected build");
        };
        assert_eq!(raw, PathBuf::from("raw.json"));
        assert_eq!(DatasetFormat::from(format), DatasetFormat::Csv);
    }

    #[test]
    fn test_cli_validate_format_optional() {
        let args = Args::try_parse_from(["marketcap-rank", "validate", "x.db"]).unwrap();
        assert!(matches!(args.command, Command::Validate { format: None, .. }));
    }

    #[test]
    fn test_cli_overrides_are_global() {
        let args = Args::try_parse_from([
            "marketcap-rank",
            "collect",
            "--api-key",
            "k",
            "--max-pages",
            "3",
        ])
        .unwrap();
        assert_eq!(args.overrides.api_key.as_deref(), Some("k"));
        assert_eq!(args.overrides.max_pages, Some(3));
    }

    #[test]
    fn test_cli_max_pages_zero_rejected() {
        let result = Args::try_parse_from(["marketcap-rank", "collect", "--max-pages", "0"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ValueValidation
        );
    }

    #[test]
    fn test_cli_checkpoints_delete() {
        let args =
            Args::try_parse_from(["marketcap-rank", "checkpoints", "delete", "2025-01-02"]).unwrap();
        let Command::Checkpoints {
            action: CheckpointAction::Delete { date },
        } = args.command
        else {
            panic!("expected checkpoints delete");
        };
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
    }

    #[test]
    fn test_cli_subcommand_required() {
        let result = Args::try_parse_from(["marketcap-rank"]);
        assert!(result.is_err());
    }
}
