use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ei_input::libei::HANDSHAKE_TIMEOUT;
use ei_input::{AuthSource, CancelToken, EiBackend, Job, NegotiationConfig, TypingConfig};
use tokio::task::{JoinError, JoinHandle};

/// Client name announced in the libei handshake.
const CLIENT_NAME: &str = "ei-type";

/// How long to wait for a ready worker after a signal. A read from a
/// quiet stdin cannot observe cancellation, so the process exits anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// Type text into the focused Wayland window via libei.
///
/// Reads text from standard input and types it, or sends a single key
/// combo with `--key`. Authorization comes from KWin's EIS interface,
/// the `RemoteDesktop` portal with `--portal`, or `LIBEI_SOCKET`.
#[derive(Parser, Debug)]
#[command(name = "ei-type", version, about)]
struct Cli {
    /// Delay between key strokes in milliseconds.
    #[arg(short, long, value_name = "MS", default_value_t = 5)]
    delay: u64,

    /// How long each key is held down, in milliseconds [default: --delay].
    #[arg(long, value_name = "MS")]
    hold: Option<u64>,

    /// Send a key combo such as `ctrl+v` or `enter` instead of reading stdin.
    #[arg(short, long, value_name = "COMBO")]
    key: Option<String>,

    /// Print connection and negotiation diagnostics to stderr.
    #[arg(short, long)]
    verbose: bool,

    /// Authorize through the XDG `RemoteDesktop` portal instead of KWin.
    #[arg(long)]
    portal: bool,

    /// Consecutive empty polls tolerated while waiting for a keyboard.
    #[arg(
        long,
        value_name = "N",
        default_value_t = 10,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    timeout_polls: u32,
}

impl Cli {
    fn typing_config(&self) -> TypingConfig {
        TypingConfig {
            key_delay: Duration::from_millis(self.delay),
            hold: Duration::from_millis(self.hold.unwrap_or(self.delay)),
        }
    }

    fn negotiation_config(&self) -> NegotiationConfig {
        NegotiationConfig {
            max_timeouts: self.timeout_polls,
            ..NegotiationConfig::default()
        }
    }

    /// Parse the combo, if any, before anything touches the compositor.
    fn job(&self) -> Result<Job> {
        match &self.key {
            Some(combo) => {
                let instruction = ei_input::parse_combo(combo)
                    .with_context(|| format!("invalid key combo '{combo}'"))?;
                Ok(Job::Combo(instruction))
            }
            None => Ok(Job::Text),
        }
    }

    const fn auth_source(&self) -> AuthSource {
        if self.portal {
            AuthSource::Portal
        } else {
            AuthSource::Kwin
        }
    }

    const fn default_log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "warn"
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.default_log_level())),
        )
        .with_writer(std::io::stderr)
        .init();

    let job = cli.job()?;
    if job == Job::Text && std::io::stdin().is_terminal() {
        tracing::info!("Reading text from the terminal; end with Ctrl-D");
    }

    let cancel = CancelToken::new();
    let mut signals = tokio::spawn(wait_for_signal(cancel.clone()));

    let setup = async {
        let channel = ei_input::authorize(cli.auth_source())
            .await
            .context("failed to obtain EIS socket")?;
        EiBackend::connect(channel, CLIENT_NAME, HANDSHAKE_TIMEOUT)
            .await
            .context("failed to connect to EIS")
    };

    let backend = tokio::select! {
        backend = setup => backend?,
        _ = &mut signals => bail!("interrupted before the keyboard was ready"),
    };

    let negotiation = cli.negotiation_config();
    let typing = cli.typing_config();
    let worker_cancel = cancel.clone();
    let ready = Arc::new(AtomicBool::new(false));
    let worker_ready = Arc::clone(&ready);
    let mut worker = tokio::task::spawn_blocking(move || {
        ei_input::run(
            backend,
            &job,
            std::io::stdin().lock(),
            &negotiation,
            &typing,
            &worker_cancel,
            move || worker_ready.store(true, Ordering::SeqCst),
        )
    });

    let outcome = tokio::select! {
        outcome = &mut worker => outcome,
        _ = &mut signals => match wait_after_signal(&mut worker, &ready, SHUTDOWN_GRACE).await {
            Some(outcome) => outcome,
            None => {
                tracing::debug!("Worker still blocked on input, exiting");
                std::process::exit(0);
            }
        },
    };

    let stats = outcome
        .context("typing task panicked")?
        .context("failed to type")?;

    tracing::debug!(
        typed = stats.typed,
        skipped = stats.skipped,
        cancelled = stats.cancelled,
        "Done"
    );
    Ok(())
}

/// Wait for the worker once cancellation has been requested.
///
/// Before the keyboard is ready the worker is negotiating and notices the
/// token within one poll, so it is always waited for and its error decides
/// the exit status. Once ready it may be stuck reading stdin; it then gets
/// `grace` to finish and `None` means give up on it.
async fn wait_after_signal<T>(
    worker: &mut JoinHandle<T>,
    ready: &AtomicBool,
    grace: Duration,
) -> Option<Result<T, JoinError>> {
    loop {
        match tokio::time::timeout(grace, &mut *worker).await {
            Ok(outcome) => return Some(outcome),
            Err(_) if ready.load(Ordering::SeqCst) => return None,
            Err(_) => tracing::debug!("Waiting for negotiation to stop"),
        }
    }
}

/// Trip `cancel` on SIGINT or SIGTERM.
async fn wait_for_signal(cancel: CancelToken) {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
                return;
            }
        };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!("Failed to listen for SIGINT: {e}");
                std::future::pending::<()>().await;
            }
            tracing::debug!("Received SIGINT, stopping");
        }
        _ = sigterm.recv() => {
            tracing::debug!("Received SIGTERM, stopping");
        }
    }

    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ei-type").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let cli = parse(&[]);
        assert_eq!(cli.typing_config(), TypingConfig::default());
        assert_eq!(cli.negotiation_config(), NegotiationConfig::default());
        assert_eq!(cli.auth_source(), AuthSource::Kwin);
        assert_eq!(cli.default_log_level(), "warn");
        assert_eq!(cli.job().unwrap(), Job::Text);
    }

    #[test]
    fn hold_follows_delay_unless_set() {
        let cli = parse(&["-d", "20"]);
        assert_eq!(cli.typing_config().hold, Duration::from_millis(20));

        let cli = parse(&["--delay", "20", "--hold", "3"]);
        let typing = cli.typing_config();
        assert_eq!(typing.key_delay, Duration::from_millis(20));
        assert_eq!(typing.hold, Duration::from_millis(3));
    }

    #[test]
    fn key_flag_parses_combo_up_front() {
        let cli = parse(&["-k", "ctrl+v"]);
        let Job::Combo(combo) = cli.job().unwrap() else {
            panic!("expected a combo job");
        };
        assert_eq!(combo.keycode, ei_input::keymap::KEY_V);
        assert_eq!(combo.modifiers, vec![ei_input::keymap::KEY_LEFTCTRL]);
    }

    #[test]
    fn bad_combo_is_rejected_before_connecting() {
        let cli = parse(&["--key", "hyper+x"]);
        let err = cli.job().unwrap_err();
        assert!(format!("{err:#}").contains("unknown modifier 'hyper'"));
    }

    #[test]
    fn flags() {
        let cli = parse(&["-v", "--portal", "--timeout-polls", "3"]);
        assert_eq!(cli.default_log_level(), "debug");
        assert_eq!(cli.auth_source(), AuthSource::Portal);
        assert_eq!(cli.negotiation_config().max_timeouts, 3);
    }

    #[test]
    fn non_numeric_delay_is_a_usage_error() {
        let result = Cli::try_parse_from(["ei-type", "--delay", "fast"]);
        assert!(result.is_err());
    }

    #[test]
    fn zero_timeout_polls_is_rejected() {
        assert!(Cli::try_parse_from(["ei-type", "--timeout-polls", "0"]).is_err());
        assert_eq!(parse(&["--timeout-polls", "1"]).negotiation_config().max_timeouts, 1);
    }

    #[tokio::test]
    async fn negotiating_worker_is_awaited_past_the_grace_period() {
        let grace = Duration::from_millis(20);
        let ready = AtomicBool::new(false);
        let mut worker = tokio::task::spawn_blocking(move || {
            std::thread::sleep(grace * 5);
            "cancelled"
        });

        let outcome = wait_after_signal(&mut worker, &ready, grace).await;
        assert_eq!(outcome.unwrap().unwrap(), "cancelled");
    }

    #[tokio::test]
    async fn ready_worker_is_abandoned_after_the_grace_period() {
        let grace = Duration::from_millis(20);
        let ready = AtomicBool::new(true);
        let mut worker = tokio::task::spawn_blocking(move || std::thread::sleep(grace * 5));

        assert!(wait_after_signal(&mut worker, &ready, grace).await.is_none());
    }

    #[tokio::test]
    async fn finished_worker_is_returned() {
        let ready = AtomicBool::new(true);
        let mut worker = tokio::task::spawn_blocking(|| 3);
        let outcome = wait_after_signal(&mut worker, &ready, Duration::from_secs(5)).await;
        assert_eq!(outcome.unwrap().unwrap(), 3);
    }
}
