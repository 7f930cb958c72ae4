//! farcall CLI: run the in-process demo or inspect configuration.

mod cli;
mod config;
mod demo;

use crate::cli::{Cli, Commands};
use clap::Parser;
use farcall_types::config::FarcallConfig;
use std::path::Path;
use tracing_subscriber::fmt::MakeWriter;

/// Subscriber used before the configuration is known. Honors `RUST_LOG`,
/// otherwise logs at info.
fn bootstrap_subscriber<W>(make_writer: W) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish()
}

/// Load the configuration with the bootstrap subscriber in scope so parse
/// and read failures are reported.
fn load_config_logged(path: Option<&Path>) -> FarcallConfig {
    tracing::subscriber::with_default(bootstrap_subscriber(std::io::stderr), || {
        config::load_config(path)
    })
}

fn init_tracing(config: &FarcallConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config_logged(cli.config.as_deref());
    init_tracing(&config);

    match cli.command {
        Commands::Demo => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(demo::run(config.protocol))?;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_config_warnings_reach_bootstrap_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "log_level = [not toml").unwrap();

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = bootstrap_subscriber(move || writer.clone());
        let config = tracing::subscriber::with_default(subscriber, || {
            config::load_config(Some(&path))
        });

        assert_eq!(config, FarcallConfig::default());
        let output = captured.text();
        assert!(output.contains("Failed to parse config"), "got: {output}");
    }
}
