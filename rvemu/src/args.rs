//! Command line handling
//!
//! Arguments come as `--key=value` pairs or bare flags; anything the parser
//! does not recognize is reported and ignored so that a typo does not
//! silently change machine behavior.

use log::LevelFilter;

#[derive(Debug, Clone)]
pub struct MachineArgs {
    /// The guest image loaded at the BIOS RAM base (required).
    pub bios_file: Option<String>,
    /// Number of harts; zero is treated as one.
    pub cores: u32,
    /// `-p`: start with hart 0 paused.
    pub start_paused: bool,
    /// Enter paused state when the guest executes EBREAK.
    pub pause_on_break: bool,
    /// Enter paused state after each hart restart.
    pub pause_on_restart: bool,
    /// Where the fault dump is written.
    pub dump_path: String,
    /// Framebuffer geometry.
    pub screen_width: u32,
    pub screen_height: u32,
    /// Log verbosity, `--log=LEVEL`.
    pub log_level: LevelFilter,
}

impl Default for MachineArgs {
    fn default() -> Self {
        MachineArgs {
            bios_file: None,
            cores: 1,
            start_paused: false,
            pause_on_break: false,
            pause_on_restart: false,
            dump_path: "dump.txt".to_string(),
            screen_width: 800,
            screen_height: 600,
            log_level: LevelFilter::Warn,
        }
    }
}

impl MachineArgs {
    /// Parse a semantic `MachineArgs` from an iterator over raw arguments.
    pub fn from_args(args: impl Iterator<Item = String>) -> Self {
        let mut parsed = MachineArgs::default();

        for arg in args {
            if let Some(path) = arg.strip_prefix("--bios_file=") {
                parsed.bios_file = Some(path.to_string());
            } else if let Some(cores) = arg.strip_prefix("--cores=") {
                parsed.cores = cores.parse().unwrap_or(1).max(1);
            } else if let Some(path) = arg.strip_prefix("--dump_path=") {
                parsed.dump_path = path.to_string();
            } else if let Some(geometry) = arg.strip_prefix("--screen=") {
                if let Some((w, h)) = geometry.split_once('x') {
                    if let (Ok(w), Ok(h)) = (w.parse(), h.parse()) {
                        parsed.screen_width = w;
                        parsed.screen_height = h;
                    }
                }
            } else if let Some(level) = arg.strip_prefix("--log=") {
                parsed.log_level = level.parse().unwrap_or(LevelFilter::Warn);
            } else if arg == "-p" {
                parsed.start_paused = true;
            } else if arg == "--pause_on_break" {
                parsed.pause_on_break = true;
            } else if arg == "--pause_on_restart" {
                parsed.pause_on_restart = true;
            } else {
                eprintln!("ignoring unknown argument {arg:?}");
            }
        }

        parsed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> MachineArgs {
        MachineArgs::from_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.cores, 1);
        assert_eq!(args.dump_path, "dump.txt");
        assert!(args.bios_file.is_none());
        assert!(!args.start_paused);
    }

    #[test]
    fn test_values_and_flags() {
        let args = parse(&[
            "--bios_file=bios.bin",
            "--cores=4",
            "-p",
            "--pause_on_break",
            "--screen=1024x768",
            "--log=debug",
        ]);
        assert_eq!(args.bios_file.as_deref(), Some("bios.bin"));
        assert_eq!(args.cores, 4);
        assert!(args.start_paused);
        assert!(args.pause_on_break);
        assert!(!args.pause_on_restart);
        assert_eq!((args.screen_width, args.screen_height), (1024, 768));
        assert_eq!(args.log_level, LevelFilter::Debug);
    }

    #[test]
    fn test_zero_cores_is_one() {
        assert_eq!(parse(&["--cores=0"]).cores, 1);
    }
}
