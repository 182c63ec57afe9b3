use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "livecheck",
    about = "Liveness decisions and identity matching over recorded face detections",
    version
)]
pub struct Cli {
    /// TOML pipeline configuration (LIVECHECK_* variables still apply on top)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit structured JSON to stdout instead of human-readable text
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase verbosity (may be used multiple times)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show which timestamps would be sampled from a clip
    Plan(PlanArgs),
    /// Run the liveness checks over a recorded clip
    Liveness(RecordingArgs),
    /// Reduce a recorded clip to one identity vector
    Aggregate(RecordingArgs),
    /// Compare two recordings (clips are liveness-gated first)
    Compare(CompareArgs),
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Clip duration in seconds
    #[arg(required_unless_present = "frames", conflicts_with = "frames")]
    pub duration: Option<f64>,

    /// Directory of extracted still frames to plan against instead
    #[arg(long, requires = "fps")]
    pub frames: Option<PathBuf>,

    /// Frame rate the stills in --frames were extracted at
    #[arg(long)]
    pub fps: Option<f64>,

    /// Cap on the number of sampled frames
    #[arg(long)]
    pub max_frames: Option<usize>,
}

#[derive(Debug, Args)]
pub struct RecordingArgs {
    /// JSON list of frame records ({"index", "observation"})
    pub recording: PathBuf,
}

#[derive(Debug, Args)]
pub struct CompareArgs {
    /// Probe recording: a frame record list or a single face observation
    pub probe: PathBuf,

    /// Reference recording: a frame record list or a single face observation
    pub reference: PathBuf,

    /// Similarity threshold (defaults to the configured match_threshold)
    #[arg(long)]
    pub threshold: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::parse_from(["livecheck", "liveness", "clip.json", "--json", "-vv"]);
        assert_eq!(cli.output_mode(), OutputMode::Json);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Liveness(_)));
    }

    #[test]
    fn plan_needs_duration_or_frames() {
        assert!(Cli::try_parse_from(["livecheck", "plan"]).is_err());
        assert!(Cli::try_parse_from(["livecheck", "plan", "--frames", "dir"]).is_err());

        let cli = Cli::try_parse_from(["livecheck", "plan", "--frames", "dir", "--fps", "30"])
            .unwrap();
        let Commands::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        assert_eq!(args.fps, Some(30.0));
        assert!(args.duration.is_none());
    }

    #[test]
    fn compare_threshold_override() {
        let cli = Cli::parse_from(["livecheck", "compare", "a.json", "b.json", "--threshold", "0.5"]);
        let Commands::Compare(ref args) = cli.command else {
            panic!("expected compare");
        };
        assert_eq!(args.threshold, Some(0.5));
        assert_eq!(cli.output_mode(), OutputMode::Human);
    }
}
