use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use upsync_core::config::RequestModeKind;
use upsync_core::sync::{CreateMethod, FetchMode, PatchMode, UpdateMethod};

#[derive(Parser)]
#[command(name = "upsync")]
#[command(about = "Record resource changes locally and upload them to a server")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store server copies of resources without recording changes
    Import {
        /// JSON file holding a resource, an array of resources or a bundle ("-" for stdin)
        file: PathBuf,
    },
    /// Create resources locally
    #[command(alias = "new")]
    Add {
        /// JSON file holding a resource, an array of resources or a bundle ("-" for stdin)
        file: PathBuf,
    },
    /// Apply a JSON patch to a stored resource
    Update {
        /// Resource type, e.g. Patient
        resource_type: String,
        /// Resource id
        id: String,
        /// JSON patch file ("-" for stdin)
        patch: PathBuf,
    },
    /// Delete a stored resource
    Delete {
        /// Resource type, e.g. Patient
        resource_type: String,
        /// Resource id
        id: String,
    },
    /// Show pending local changes
    Status {
        /// Number of changes to list
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Upload pending changes to the server
    Upload(UploadArgs),
}

#[derive(Args, Debug, Default)]
pub struct UploadArgs {
    /// Upload config file (JSON)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Server base URL (overrides `UPSYNC_SERVER_URL`)
    #[arg(long, value_name = "URL")]
    pub server: Option<String>,
    #[arg(long, value_enum)]
    pub fetch_mode: Option<FetchModeArg>,
    #[arg(long, value_enum)]
    pub patch_mode: Option<PatchModeArg>,
    #[arg(long, value_enum)]
    pub request_mode: Option<RequestModeArg>,
    /// Maximum entries per transaction bundle
    #[arg(long)]
    pub max_entries: Option<usize>,
    /// Method used to create resources
    #[arg(long, value_enum)]
    pub create: Option<MethodArg>,
    /// Method used to update resources
    #[arg(long, value_enum)]
    pub update: Option<MethodArg>,
    /// Do not send If-Match headers
    #[arg(long)]
    pub no_etag: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum FetchModeArg {
    All,
    PerResourceEarliest,
    PerResourceAll,
}

impl From<FetchModeArg> for FetchMode {
    fn from(value: FetchModeArg) -> Self {
        match value {
            FetchModeArg::All => Self::All,
            FetchModeArg::PerResourceEarliest => Self::PerResourceEarliest,
            FetchModeArg::PerResourceAll => Self::PerResourceAll,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum PatchModeArg {
    Direct,
    Squash,
}

impl From<PatchModeArg> for PatchMode {
    fn from(value: PatchModeArg) -> Self {
        match value {
            PatchModeArg::Direct => Self::Direct,
            PatchModeArg::Squash => Self::PerResourceSquash,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum RequestModeArg {
    Bundle,
    Individual,
}

impl From<RequestModeArg> for RequestModeKind {
    fn from(value: RequestModeArg) -> Self {
        match value {
            RequestModeArg::Bundle => Self::Bundle,
            RequestModeArg::Individual => Self::Individual,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum MethodArg {
    Put,
    Post,
    Patch,
}

impl MethodArg {
    pub const fn create_method(self) -> Option<CreateMethod> {
        match self {
            Self::Put => Some(CreateMethod::Put),
            Self::Post => Some(CreateMethod::Post),
            Self::Patch => None,
        }
    }

    pub const fn update_method(self) -> Option<UpdateMethod> {
        match self {
            Self::Put => Some(UpdateMethod::Put),
            Self::Patch => Some(UpdateMethod::Patch),
            Self::Post => None,
        }
    }
}
