use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// The workspace's own crates. A bare level in the configuration applies to
/// these; third-party dependencies stay at their default verbosity.
const NODE_TARGETS: &[&str] = &["cairn", "cairn_core", "cairn_store"];

/// Initializes the global subscriber.
///
/// The configured filter may be a bare level (`debug`), which fans out over
/// the node's crates, or a full tracing directive string, which is used as
/// given. Without a configured filter, `RUST_LOG` wins when set and the
/// node otherwise logs its own crates at `info`.
pub fn setup_tracing(filter: Option<String>) {
    let env_filter = match filter.as_deref() {
        Some(value) => EnvFilter::new(match Level::from_str(value) {
            Ok(level) => node_directives(level),
            Err(_) => value.to_string(),
        }),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(node_directives(Level::INFO))),
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .try_init()
        .ok();
}

fn node_directives(level: Level) -> String {
    NODE_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_level_covers_every_workspace_crate() {
        let directives = node_directives(Level::DEBUG);
        assert_eq!(directives, "cairn=DEBUG,cairn_core=DEBUG,cairn_store=DEBUG");
    }
}
