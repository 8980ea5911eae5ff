use crate::plugins::registry::{CliPlugin, DriverContext};
use clap::{Arg, ArgMatches, Command};

pub struct HttpCliPlugin;

impl HttpCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpCliPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl CliPlugin for HttpCliPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    // No default values: absent flags leave the config file's settings in place.
    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("http_user_agent")
                .long("user-agent")
                .help_heading("HTTP")
                .help("HTTP User-Agent for image downloads")
                .num_args(1),
        )
        .arg(
            Arg::new("http_timeout_secs")
                .long("timeout-secs")
                .help_heading("HTTP")
                .help("Seconds to wait for the server's response headers")
                .num_args(1),
        )
        .arg(
            Arg::new("http_retries")
                .long("retries")
                .help_heading("HTTP")
                .help("Retries for transient errors before the body starts")
                .num_args(1),
        )
        .arg(
            Arg::new("http_retry_backoff_ms")
                .long("retry-backoff-ms")
                .help_heading("HTTP")
                .help("Retry backoff base in milliseconds")
                .num_args(1),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, ctx: &mut DriverContext) -> anyhow::Result<()> {
        if let Some(ua) = matches.get_one::<String>("http_user_agent") {
            ctx.user_agent = ua.clone();
        }
        if let Some(s) = matches.get_one::<String>("http_timeout_secs") {
            ctx.timeout_secs = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_retries") {
            ctx.retries = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_retry_backoff_ms") {
            ctx.retry_backoff_ms = s.parse()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> DriverContext {
        DriverContext {
            user_agent: "from-config".to_string(),
            timeout_secs: 60,
            retries: 2,
            retry_backoff_ms: 400,
        }
    }

    #[test]
    fn flags_override_only_what_is_given() {
        let plugin = HttpCliPlugin::new();
        let cmd = plugin.augment_command(Command::new("serve"));
        let m = cmd.try_get_matches_from(["serve", "--retries", "5"]).unwrap();

        let mut ctx = base();
        plugin.apply_matches(&m, &mut ctx).unwrap();
        assert_eq!(ctx.retries, 5);
        assert_eq!(ctx.user_agent, "from-config");
        assert_eq!(ctx.timeout_secs, 60);
    }

    #[test]
    fn bad_number_is_an_error() {
        let plugin = HttpCliPlugin::new();
        let cmd = plugin.augment_command(Command::new("serve"));
        let m = cmd.try_get_matches_from(["serve", "--timeout-secs", "soon"]).unwrap();
        assert!(plugin.apply_matches(&m, &mut base()).is_err());
    }
}
