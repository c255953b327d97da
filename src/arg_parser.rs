use std::path::PathBuf;

use argparse::{ArgumentParser, Print, StoreOption, StoreTrue};

#[derive(Debug, Default)]
pub struct ArgsOptions {
    // Device profile, the built-in one when not given
    pub config_file_path: Option<PathBuf>,
    // Override of the profile poll interval, in seconds
    pub interval_secs: Option<u64>,

    // Run a single cycle and print the report
    pub once: bool,
    // Print the effective device profile and exit
    pub dump_config: bool,
}

impl ArgsOptions {
    pub fn parse() -> Self {
        let mut options = ArgsOptions::default();

        {
            let mut parser = ArgumentParser::new();
            parser.set_description("Switch platform fan control daemon");

            // Configuration file path
            parser.refer(&mut options.config_file_path).add_option(
                &["-c", "--config"],
                StoreOption,
                "The file path of the Json device profile",
            );

            parser.refer(&mut options.interval_secs).add_option(
                &["-i", "--interval"],
                StoreOption,
                "Seconds between two control cycles",
            );

            parser.refer(&mut options.once).add_option(
                &["--once"],
                StoreTrue,
                "Run one control cycle, print the report and exit",
            );

            parser.refer(&mut options.dump_config).add_option(
                &["--dump-config"],
                StoreTrue,
                "Print the effective device profile and exit",
            );

            // Show daemon version
            parser.add_option(
                &["-V", "--version"],
                Print(env!("CARGO_PKG_VERSION").to_string()),
                "Show the daemon version",
            );

            parser.parse_args_or_exit();
        }

        options
    }
}
