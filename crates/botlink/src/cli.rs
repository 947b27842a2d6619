use std::path::PathBuf;

static HELP_STR_CONFIG: &str = "
    Path of a TOML config file. Every setting has a default, so this can be \
                                omitted. The supervisor hands the same path \
                                to the gateway and worker it starts. \
                                Example value: \"/etc/botlink.toml\"
";

static HELP_STR_LOG: &str = "Optional log path value. If not provided, logs \
                             go to stderr";

#[derive(clap::Parser, Debug, Clone, PartialEq, Eq)]
#[command(
    name = "botlink",
    version,
    about = "botlink",
    long_about = "Runs uploaded robot control projects for one remote client \
                  at a time. `supervise` is the normal entry point; it \
                  starts and watches the `gateway` and `worker` processes."
)]
pub enum Args {
    /// Start and monitor the gateway and worker processes
    Supervise {
        #[arg(long, short, value_name = "CONFIG", help = HELP_STR_CONFIG)]
        config: Option<PathBuf>,
        #[arg(long, short = 'l', value_name = "LOG_PATH", help = HELP_STR_LOG)]
        log_path: Option<PathBuf>,
    },
    /// Accept the client connection and forward its commands
    Gateway {
        #[arg(long, short, value_name = "CONFIG", help = HELP_STR_CONFIG)]
        config: Option<PathBuf>,
        #[arg(long, short = 'l', value_name = "LOG_PATH", help = HELP_STR_LOG)]
        log_path: Option<PathBuf>,
    },
    /// Load the current project and execute commands against it
    Worker {
        #[arg(long, short, value_name = "CONFIG", help = HELP_STR_CONFIG)]
        config: Option<PathBuf>,
        #[arg(long, short = 'l', value_name = "LOG_PATH", help = HELP_STR_LOG)]
        log_path: Option<PathBuf>,
    },
}

impl Args {
    pub fn config(&self) -> Option<&PathBuf> {
        match self {
            Args::Supervise { config, .. }
            | Args::Gateway { config, .. }
            | Args::Worker { config, .. } => config.as_ref(),
        }
    }

    pub fn log_path(&self) -> Option<&PathBuf> {
        match self {
            Args::Supervise { log_path, .. }
            | Args::Gateway { log_path, .. }
            | Args::Worker { log_path, .. } => log_path.as_ref(),
        }
    }

    /// Subcommand name, also used to tag log lines.
    pub fn role(&self) -> &'static str {
        match self {
            Args::Supervise { .. } => "supervise",
            Args::Gateway { .. } => "gateway",
            Args::Worker { .. } => "worker",
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parses_role_and_paths() {
        let args = Args::try_parse_from([
            "botlink",
            "worker",
            "--config",
            "/etc/botlink.toml",
            "-l",
            "/tmp/w.log",
        ])
        .unwrap();
        assert_eq!(args.role(), "worker");
        assert_eq!(args.config(), Some(&PathBuf::from("/etc/botlink.toml")));
        assert_eq!(args.log_path(), Some(&PathBuf::from("/tmp/w.log")));
    }

    #[test]
    fn config_is_optional() {
        let args = Args::try_parse_from(["botlink", "supervise"]).unwrap();
        assert_eq!(args.config(), None);
        assert!(Args::try_parse_from(["botlink", "daemon"]).is_err());
    }
}
