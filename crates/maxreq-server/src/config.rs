//! Command line and environment configuration.
//!
//! Handoff settings start from [`HandoffConfig::from_env`] and flags override
//! them. A successor is started with the same argv and environment, so both
//! processes always agree on the listener list and thresholds.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use maxreq_handoff::{HandoffConfig, ListenAddress, DEFAULT_ADDRESS};
use tracing::info;

use crate::app::AppKind;
use crate::telemetry::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "maxreq-server")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on: tcp:<port>[:interface=<host>] or unix:<path>.
    /// Repeat the flag for several listeners; MAXREQ_LISTEN supplies a single one.
    #[arg(short, long = "listen", value_name = "ADDRESS", env = "MAXREQ_LISTEN")]
    pub listen: Vec<ListenAddress>,

    /// Requests to serve before handing off to a fresh process
    /// [default: MAXREQ_MAX_REQUESTS or 100].
    #[arg(short = 'n', long, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_requests: Option<u64>,

    /// Seconds to wait for the successor to start accepting
    /// [default: MAXREQ_READY_TIMEOUT_SECS or 30].
    #[arg(long)]
    pub ready_timeout_secs: Option<u64>,

    /// Seconds to wait for in-flight requests after handoff, 0 waits forever
    /// [default: MAXREQ_DRAIN_TIMEOUT_SECS or 30].
    #[arg(long)]
    pub drain_timeout_secs: Option<u64>,

    /// Failed handoff attempts before giving up, 0 retries forever
    /// [default: MAXREQ_MAX_HANDOFF_ATTEMPTS or 0]. WARNING: once a non-zero
    /// limit is used up the server stops accepting and exits without a
    /// successor, leaving the address unserved.
    #[arg(long)]
    pub max_handoff_attempts: Option<u32>,

    /// Write a Combined Log Format access log to this file.
    #[arg(long, env = "MAXREQ_LOGFILE")]
    pub logfile: Option<PathBuf>,

    /// Built-in application to serve.
    #[arg(long, value_enum, env = "MAXREQ_APP", default_value_t = AppKind::Identity)]
    pub app: AppKind,

    /// Diagnostic log format.
    #[arg(long, value_enum, env = "MAXREQ_LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

/// Effective server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: Vec<ListenAddress>,
    pub handoff: HandoffConfig,
    pub logfile: Option<PathBuf>,
    pub app: AppKind,
}

impl ServerConfig {
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        Self::with_handoff_base(cli, HandoffConfig::from_env())
    }

    /// Apply the handoff flags given on the command line on top of `base`.
    fn with_handoff_base(cli: &Cli, base: HandoffConfig) -> anyhow::Result<Self> {
        let listen = if cli.listen.is_empty() {
            vec![DEFAULT_ADDRESS.parse()?]
        } else {
            cli.listen.clone()
        };

        let mut handoff = base;
        if let Some(max_requests) = cli.max_requests {
            handoff.max_requests = max_requests;
        }
        if let Some(secs) = cli.ready_timeout_secs {
            handoff.ready_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = cli.drain_timeout_secs {
            handoff.drain_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(attempts) = cli.max_handoff_attempts {
            handoff.max_handoff_attempts = attempts;
        }

        Ok(Self {
            listen,
            handoff,
            logfile: cli.logfile.clone(),
            app: cli.app,
        })
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        for (index, address) in self.listen.iter().enumerate() {
            info!(index, %address, "Listen address");
        }
        info!(
            max_requests = self.handoff.max_requests,
            ready_timeout_secs = self.handoff.ready_timeout.as_secs(),
            "Handoff after {} request(s)",
            self.handoff.max_requests
        );
        match self.handoff.drain_timeout {
            Some(timeout) => info!("Drain timeout: {}s", timeout.as_secs()),
            None => info!("Drain timeout: none (wait for every connection)"),
        }
        match self.handoff.max_handoff_attempts {
            0 => info!("Handoff attempts: unlimited"),
            n => info!("Handoff attempts: {}", n),
        }
        match &self.logfile {
            Some(path) => info!("Access log: {}", path.display()),
            None => info!("Access log: disabled"),
        }
        info!(app = ?self.app, "Application");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("maxreq-server").chain(args.iter().copied())).unwrap()
    }

    fn parse(args: &[&str]) -> ServerConfig {
        ServerConfig::with_handoff_base(&cli(args), HandoffConfig::default()).unwrap()
    }

    #[test]
    fn test_repeated_listen_flags() {
        let config = parse(&[
            "--listen",
            "tcp:8081:interface=127.0.0.1",
            "--logfile",
            "/tmp/access.log",
            "--listen",
            "unix:/tmp/maxreq.sock",
            "--max-requests",
            "3",
        ]);
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.listen[0].to_string(), "tcp:8081:interface=127.0.0.1");
        assert_eq!(config.listen[1], ListenAddress::Unix("/tmp/maxreq.sock".into()));
        assert_eq!(config.handoff.max_requests, 3);
        assert_eq!(config.logfile, Some(PathBuf::from("/tmp/access.log")));
    }

    #[test]
    fn test_zero_drain_timeout_waits_forever() {
        let config = parse(&["--listen", "tcp:0", "--drain-timeout-secs", "0"]);
        assert_eq!(config.handoff.drain_timeout, None);
    }

    #[test]
    fn test_rejects_bad_address() {
        let err = Cli::try_parse_from(["maxreq-server", "--listen", "udp:53"]).unwrap_err();
        assert!(err.to_string().contains("udp:53"), "{err}");
    }

    #[test]
    fn test_rejects_zero_max_requests() {
        assert!(Cli::try_parse_from(["maxreq-server", "--max-requests", "0"]).is_err());
    }

    #[test]
    fn test_flags_override_environment_base() {
        let base = HandoffConfig {
            max_requests: 7,
            drain_timeout: None,
            max_handoff_attempts: 4,
            ..HandoffConfig::default()
        };

        let config = ServerConfig::with_handoff_base(&cli(&[]), base.clone()).unwrap();
        assert_eq!(config.handoff, base);

        let config = ServerConfig::with_handoff_base(
            &cli(&["--max-requests", "3", "--drain-timeout-secs", "5", "--ready-timeout-secs", "2"]),
            base,
        )
        .unwrap();
        assert_eq!(config.handoff.max_requests, 3);
        assert_eq!(config.handoff.drain_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.handoff.ready_timeout, Duration::from_secs(2));
        assert_eq!(config.handoff.max_handoff_attempts, 4);
    }

    #[test]
    fn test_unix_path_with_comma_is_one_listener() {
        let config = parse(&["--listen", "unix:/tmp/a,b.sock"]);
        assert_eq!(config.listen, vec![ListenAddress::Unix("/tmp/a,b.sock".into())]);
    }

    #[test]
    fn test_attempt_limit_help_warns_about_outage() {
        let command = Cli::command();
        let arg = command
            .get_arguments()
            .find(|arg| arg.get_id() == "max_handoff_attempts")
            .unwrap();
        let help = arg.get_long_help().or(arg.get_help()).unwrap().to_string();
        assert!(help.contains("stops accepting and exits without a successor"), "{help}");
    }

    #[test]
    fn test_app_selection() {
        let config = parse(&["--listen", "tcp:0", "--app", "echo"]);
        assert_eq!(config.app, AppKind::Echo);
    }
}
