use async_trait::async_trait;
use bytes::Bytes;
use clap::{ArgMatches, Command};
use futures::stream::BoxStream;
use percent_encoding::percent_decode_str;
use sanitize_filename::sanitize;
use std::sync::Arc;
use url::Url;

#[derive(Debug, Clone)]
pub struct DriverContext {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

/// An opened source: announced length (if any) plus the body chunks.
pub struct TransferStream {
    pub total: Option<u64>,
    pub body: BoxStream<'static, anyhow::Result<Bytes>>,
}

#[async_trait]
pub trait TransferDriver: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports(&self, source: &Url) -> bool;

    /// Opens the source for a single sequential read.
    async fn open(&self, source: &Url, ctx: &DriverContext) -> anyhow::Result<TransferStream>;
}

pub trait CliPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn augment_command(&self, cmd: Command) -> Command;
    fn apply_matches(&self, matches: &ArgMatches, ctx: &mut DriverContext) -> anyhow::Result<()>;
}

pub struct PluginRegistry {
    drivers: Vec<Arc<dyn TransferDriver>>,
    cli_plugins: Vec<Box<dyn CliPlugin>>,
}

impl PluginRegistry {
    pub fn empty() -> Self {
        Self { drivers: vec![], cli_plugins: vec![] }
    }

    pub fn with_defaults() -> Self {
        let mut reg = Self::empty();

        reg.drivers.push(Arc::new(crate::plugins::http::driver::HttpDriver::new()));
        reg.drivers.push(Arc::new(crate::plugins::file::driver::FileDriver::new()));

        reg.cli_plugins.push(Box::new(crate::plugins::http::cli::HttpCliPlugin::new()));
        reg
    }

    /// Later registrations take precedence over earlier ones for the same scheme.
    pub fn register_driver(&mut self, driver: Arc<dyn TransferDriver>) {
        self.drivers.insert(0, driver);
    }

    pub fn augment_command(&self, cmd: Command) -> Command {
        self.cli_plugins
            .iter()
            .fold(cmd, |c, p| p.augment_command(c))
    }

    pub fn apply_matches(&self, matches: &ArgMatches, ctx: &mut DriverContext) -> anyhow::Result<()> {
        for p in &self.cli_plugins {
            p.apply_matches(matches, ctx)?;
        }
        Ok(())
    }

    pub fn driver_for(&self, source: &Url) -> Option<Arc<dyn TransferDriver>> {
        self.drivers.iter().find(|d| d.supports(source)).cloned()
    }
}

/// Last non-empty path segment of `url`, sanitized for use as a file name.
pub fn file_name_from_url(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|s| s.filter(|s| !s.is_empty()).last())
        .map(|s| sanitize(percent_decode_str(s).decode_utf8_lossy()))
        .filter(|s| !s.is_empty())
}
