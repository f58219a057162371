//! osmsync CLI
//!
//! Command-line client for an OSM-style versioned-data API.
//!
//! # Commands
//!
//! - `capabilities` - Show the limits the server announces
//! - `download` - Save a bounding box or a list of objects to a file
//! - `upload` - Upload an osmChange file
//! - `changesets` - Show changesets by id
//! - `close` - Close a changeset
//! - `reconcile` - Re-check changesets left open by earlier uploads

mod commands;

use clap::{Parser, Subcommand};
use commands::download::DownloadSource;
use commands::upload::UploadOptions;
use commands::ConnectOptions;
use osmsync_transfer::{AuthMethod, MaxChangesetSizeExceededPolicy};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Transfers edits to and from an OSM-style API.
#[derive(Parser)]
#[command(name = "osmsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Preferences file with key=value lines
    #[arg(global = true, long)]
    prefs: Option<PathBuf>,

    /// API server URL, without the version segment
    #[arg(global = true, short, long)]
    server: Option<String>,

    /// Authentication method (basic, oauth)
    #[arg(global = true, long)]
    auth: Option<AuthMethod>,

    /// Basic-auth user
    #[arg(global = true, short, long)]
    user: Option<String>,

    /// Basic-auth password
    #[arg(global = true, long)]
    password: Option<String>,

    /// Signed-token credentials: consumer_key:consumer_secret:token:token_secret
    #[arg(global = true, long)]
    token: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the limits the server announces
    Capabilities {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Save a bounding box or a list of objects to a file
    Download {
        /// Bounding box: min_lon,min_lat,max_lon,max_lat
        #[arg(short, long, conflicts_with = "ids")]
        bbox: Option<String>,

        /// Element type of --ids (node, way, relation)
        #[arg(short, long, default_value = "node")]
        kind: String,

        /// Comma separated ids
        #[arg(short, long)]
        ids: Option<String>,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Upload an osmChange file
    Upload {
        /// osmChange file
        file: PathBuf,

        /// Upload strategy (individualobjects, chunked, singlerequest)
        #[arg(long)]
        strategy: Option<String>,

        /// Edits per request for the chunked strategy
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Full changeset policy (abort, fill, auto)
        #[arg(long)]
        policy: Option<MaxChangesetSizeExceededPolicy>,

        /// Skip the chunk rejected by a full changeset instead of retrying it
        #[arg(long)]
        skip_failed_chunk: bool,

        /// Leave the changeset open after the upload
        #[arg(long)]
        keep_open: bool,

        /// Changeset tag as key=value, repeatable
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Upload into this open changeset
        #[arg(short, long)]
        changeset: Option<u64>,

        /// State file tracking changesets left open
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Show changesets by id
    Changesets {
        /// Changeset ids
        #[arg(required = true)]
        ids: Vec<u64>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Close a changeset
    Close {
        /// Changeset id
        id: u64,
    },

    /// Re-check changesets left open by earlier uploads
    Reconcile {
        /// State file written by `upload --state`
        #[arg(long)]
        state: PathBuf,

        /// Only query changesets older than this many minutes
        #[arg(long, default_value = "0")]
        min_age_minutes: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn parse_tag(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("tag '{}' is not key=value", raw))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut connect = ConnectOptions {
        prefs: cli.prefs,
        server: cli.server,
        auth: cli.auth,
        user: cli.user,
        password: cli.password,
        token: cli.token,
        min_age: None,
    };

    match cli.command {
        Commands::Capabilities { format } => {
            let session = connect.connect()?;
            commands::capabilities::run(&session, &format)?;
        }
        Commands::Download {
            bbox,
            kind,
            ids,
            output,
        } => {
            let source = match (bbox, ids) {
                (Some(bbox), _) => DownloadSource::bbox(&bbox)?,
                (None, Some(ids)) => DownloadSource::objects(&kind, &ids)?,
                (None, None) => return Err("either --bbox or --ids is required".into()),
            };
            let session = connect.connect()?;
            commands::download::run(&session, &source, &output)?;
        }
        Commands::Upload {
            file,
            strategy,
            chunk_size,
            policy,
            skip_failed_chunk,
            keep_open,
            tags,
            changeset,
            state,
        } => {
            let tags = tags
                .iter()
                .map(|t| parse_tag(t))
                .collect::<Result<Vec<_>, _>>()?;
            let options = UploadOptions {
                strategy,
                chunk_size,
                policy,
                skip_failed_chunk,
                keep_open,
                tags,
                changeset,
                state,
            };
            let session = connect.connect()?;
            commands::upload::run(&session, &file, &options)?;
        }
        Commands::Changesets { ids, format } => {
            let session = connect.connect()?;
            commands::changesets::run(&session, &ids, &format)?;
        }
        Commands::Close { id } => {
            let session = connect.connect()?;
            commands::close::run(&session, id)?;
        }
        Commands::Reconcile {
            state,
            min_age_minutes,
            format,
        } => {
            connect.min_age = Some(Duration::from_secs(min_age_minutes.saturating_mul(60)));
            let session = connect.connect()?;
            commands::reconcile::run(&session, &state, &format)?;
        }
        Commands::Version => {
            println!("osmsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Protocol {}", osmsync_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_upload_arguments() {
        let cli = Cli::try_parse_from([
            "osmsync",
            "--server",
            "http://localhost/api",
            "upload",
            "change.osc",
            "--strategy",
            "chunked",
            "--chunk-size",
            "100",
            "--policy",
            "auto",
            "-t",
            "comment=fix",
        ])
        .unwrap();
        assert_eq!(cli.server.as_deref(), Some("http://localhost/api"));
        match cli.command {
            Commands::Upload {
                chunk_size,
                policy,
                tags,
                ..
            } => {
                assert_eq!(chunk_size, Some(100));
                assert_eq!(
                    policy,
                    Some(MaxChangesetSizeExceededPolicy::AutomaticallyOpenNewChangesets)
                );
                assert_eq!(tags, vec!["comment=fix".to_string()]);
            }
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn tag_parsing() {
        assert_eq!(
            parse_tag("source = survey").unwrap(),
            ("source".to_string(), "survey".to_string())
        );
        assert!(parse_tag("novalue").is_err());
        assert!(parse_tag("=x").is_err());
    }
}
