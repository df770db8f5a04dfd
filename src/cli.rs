use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Parser, Debug)]
#[command(rename_all = "kebab-case", version, about = "Tail files and ship their lines in bundles.")]
pub struct Opts {
    /// Read configuration from a TOML file.
    #[arg(short, long, env = "LOGSHIP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Files to tail, in addition to the `files` from the configuration.
    pub files: Vec<PathBuf>,

    /// Enable more detailed internal logging. Repeat to increase level. Overridden by `--quiet`.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Reduce detail of internal logging. Repeat to reduce further. Overrides `--verbose`.
    #[arg(short, long, action = ArgAction::Count)]
    pub quiet: u8,
}

impl Opts {
    pub const fn log_level(&self) -> &'static str {
        match self.quiet {
            0 => match self.verbose {
                0 => "info",
                1 => "debug",
                2..=255 => "trace",
            },
            1 => "warn",
            2 => "error",
            3..=255 => "off",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        let opts = Opts::parse_from(["logship"]);
        assert_eq!(opts.log_level(), "info");

        let opts = Opts::parse_from(["logship", "-vv"]);
        assert_eq!(opts.log_level(), "trace");

        let opts = Opts::parse_from(["logship", "-q", "-v"]);
        assert_eq!(opts.log_level(), "warn");
    }

    #[test]
    fn positional_files_are_collected() {
        let opts = Opts::parse_from(["logship", "a.log", "b.log"]);
        assert_eq!(opts.files.len(), 2);
    }
}
