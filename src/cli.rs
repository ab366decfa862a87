use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

/// Kids Guard
///
/// Keeps screen brightness, audio volume and daily screen time at the
/// values a parent has set, and locks the session when time runs out.
#[derive(Parser, Debug)]
#[command(name = "kids-guard")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for persisted state and the control socket
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the enforcement process in the foreground
    Run {
        /// Use in-memory devices instead of the real ones
        #[arg(long)]
        simulated: bool,
    },
    /// Screen brightness
    Brightness {
        #[command(subcommand)]
        command: SettingCommands,
    },
    /// Audio volume
    Volume {
        #[command(subcommand)]
        command: SettingCommands,
    },
    /// Daily screen-time limit
    ScreenTime {
        #[command(subcommand)]
        command: ScreenTimeCommands,
    },
    /// Parent PIN
    Pin {
        #[command(subcommand)]
        command: PinCommands,
    },
    /// Unlock the session with the parent PIN
    Unlock {
        /// PIN (read from stdin when omitted)
        #[arg(long)]
        pin: Option<String>,
    },
    /// Start an emergency call while locked
    Emergency,
    /// Show what is being enforced
    Status,
    /// Print enforcement events as they happen
    Events,
    /// Stop the enforcement process (enforcement resumes on next start)
    Shutdown,
}

#[derive(Subcommand, Debug)]
pub enum SettingCommands {
    /// Set the value once without enforcing it
    Set { percent: i32 },
    /// Read the current value
    Get,
    /// Keep the value pinned to a target
    Enforce {
        percent: i64,

        /// Store the target without enforcing it
        #[arg(long)]
        store_only: bool,
    },
    /// Stop enforcing and forget the target
    Release,
    /// Show the enforced target
    Status,
}

#[derive(Subcommand, Debug)]
pub enum ScreenTimeCommands {
    /// Start a limit
    Enforce(LimitArgs),
    /// Remove the limit
    Release,
    /// Show elapsed and remaining time
    Status,
}

#[derive(ClapArgs, Debug)]
pub struct LimitArgs {
    /// Limit in minutes
    #[arg(long, conflicts_with = "seconds", required_unless_present = "seconds")]
    pub minutes: Option<i64>,

    /// Limit in seconds
    #[arg(long)]
    pub seconds: Option<i64>,
}

impl LimitArgs {
    pub fn limit_seconds(&self) -> i64 {
        match (self.seconds, self.minutes) {
            (Some(seconds), _) => seconds,
            (None, Some(minutes)) => minutes.saturating_mul(60),
            (None, None) => 0,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum PinCommands {
    /// Set the parent PIN (4-8 digits)
    Set { pin: String },
    /// Change the parent PIN
    Change {
        #[arg(long)]
        old: String,
        #[arg(long)]
        new: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_commands() {
        let args =
            Args::try_parse_from(["kids-guard", "-v", "brightness", "enforce", "60"]).unwrap();
        assert!(args.verbose);
        assert!(matches!(
            args.command,
            Commands::Brightness {
                command: SettingCommands::Enforce {
                    percent: 60,
                    store_only: false
                }
            }
        ));
    }

    #[test]
    fn limit_in_minutes_or_seconds() {
        let args = Args::try_parse_from([
            "kids-guard",
            "screen-time",
            "enforce",
            "--minutes",
            "90",
        ])
        .unwrap();
        let Commands::ScreenTime {
            command: ScreenTimeCommands::Enforce(limit),
        } = args.command
        else {
            panic!("expected screen-time enforce");
        };
        assert_eq!(limit.limit_seconds(), 5400);

        assert!(Args::try_parse_from(["kids-guard", "screen-time", "enforce"]).is_err());
    }
}
