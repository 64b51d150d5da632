use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "retouch")]
#[command(version, about = "Marketplace image compliance fixer")]
pub struct Cli {
    /// Print live reasoning traces while verifying.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory holding retouch.toml; defaults to the cwd.
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the fix loop on an image that failed compliance analysis
    Fix {
        /// Image file to fix
        #[arg(long)]
        image: PathBuf,
        /// Compliance report JSON from the analysis step
        #[arg(long)]
        report: PathBuf,
        /// Where to write the fixed image; defaults next to the input
        #[arg(long)]
        out: Option<PathBuf>,
        /// Write the full attempt trail as JSON to this path
        #[arg(long)]
        trail: Option<PathBuf>,
        /// Generate→verify attempts before giving up
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Minimum verification score treated as a pass
        #[arg(long)]
        threshold: Option<u8>,
        /// Image category steering the instruction template
        #[arg(long)]
        category: Option<String>,
        /// Verbatim generation instruction, bypassing composition
        #[arg(long)]
        prompt: Option<String>,
        /// Listing main image used as an identity reference
        #[arg(long)]
        reference: Option<PathBuf>,
    },
    /// Pretty-print a compliance report
    Inspect {
        /// Compliance report JSON
        report: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("retouch=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let project_dir = cli
        .project_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    match &cli.command {
        Commands::Fix {
            image,
            report,
            out,
            trail,
            max_attempts,
            threshold,
            category,
            prompt,
            reference,
        } => {
            cmd::cmd_fix(cmd::FixArgs {
                project_dir,
                image: image.clone(),
                report: report.clone(),
                out: out.clone(),
                trail: trail.clone(),
                max_attempts: *max_attempts,
                threshold: *threshold,
                category: category.clone(),
                prompt: prompt.clone(),
                reference: reference.clone(),
                verbose: cli.verbose,
            })
            .await
        }
        Commands::Inspect { report } => cmd::cmd_inspect(report),
    }
}
