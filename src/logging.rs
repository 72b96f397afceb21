//! Diagnostics on stderr via `tracing`, leaving stdout to command output.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter for a given number of `-v` flags.
fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "muster=info",
        _ => "muster=debug",
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `-v` when set.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_level() {
        assert_eq!(default_directive(0), "warn");
        assert_eq!(default_directive(1), "muster=info");
        assert_eq!(default_directive(5), "muster=debug");
    }

    #[test]
    fn repeated_init_does_not_panic() {
        init(0);
        init(2);
        tracing::debug!("still fine");
    }
}
