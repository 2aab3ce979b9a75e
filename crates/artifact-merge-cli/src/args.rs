use artifact_merge::EncryptionPolicy;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "artifact-merge",
    version,
    about = "Merge zip and tar-family build artifacts from a blob store into a single zip archive"
)]
pub struct Cli {
    /// Job event JSON file, or `-` for stdin
    #[arg(long, default_value = "-")]
    pub event: String,

    /// Blob store URL (s3://[region], file:///root, memory://)
    #[arg(long, env = "ARTIFACT_MERGE_STORE")]
    pub store: Option<String>,

    /// YAML config file (store, encryption_policy, staging_dir, limits)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// How the output's encryption setting is chosen: first, last or uniform
    #[arg(long)]
    pub encryption_policy: Option<EncryptionPolicy>,

    /// Directory for tar conversion staging files (default: system temp)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,
}
