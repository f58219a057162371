//! Capabilities command implementation.

use super::CommandResult;
use osmsync_transfer::TransferSession;
use serde::Serialize;

/// Limits announced by the server.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CapabilitiesSummary {
    /// API server URL.
    pub server: String,
    /// Lowest supported protocol version.
    pub min_version: Option<String>,
    /// Highest supported protocol version.
    pub max_version: Option<String>,
    /// Maximum number of edits per changeset.
    pub max_changeset_size: Option<usize>,
    /// Maximum number of nodes per way.
    pub max_way_nodes: Option<u64>,
    /// Server timeout in seconds.
    pub timeout_seconds: Option<u64>,
}

/// Fetches the server capabilities.
pub fn fetch(session: &TransferSession) -> CommandResult<CapabilitiesSummary> {
    let capabilities = session.api().initialize()?;
    Ok(CapabilitiesSummary {
        server: session.config().server_url.clone(),
        min_version: capabilities.get("version", "minimum").map(str::to_string),
        max_version: capabilities.get("version", "maximum").map(str::to_string),
        max_changeset_size: capabilities.max_changeset_size(),
        max_way_nodes: capabilities.max_way_nodes(),
        timeout_seconds: capabilities.timeout_seconds(),
    })
}

/// Runs the capabilities command.
pub fn run(session: &TransferSession, format: &str) -> CommandResult<()> {
    let summary = fetch(session)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => print_text_output(&summary),
    }
    Ok(())
}

fn print_text_output(summary: &CapabilitiesSummary) {
    fn show<T: std::fmt::Display>(value: &Option<T>) -> String {
        value
            .as_ref()
            .map(T::to_string)
            .unwrap_or_else(|| "-".to_string())
    }

    println!("Server:              {}", summary.server);
    println!(
        "Protocol versions:   {} to {}",
        show(&summary.min_version),
        show(&summary.max_version)
    );
    println!("Changeset size:      {}", show(&summary.max_changeset_size));
    println!("Way nodes:           {}", show(&summary.max_way_nodes));
    println!("Timeout (s):         {}", show(&summary.timeout_seconds));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing;

    #[test]
    fn reads_server_limits() {
        let (_server, session) = testing::session();
        let summary = fetch(&session).unwrap();
        assert_eq!(summary.server, testing::SERVER_URL);
        assert_eq!(summary.min_version.as_deref(), Some("0.6"));
        assert_eq!(summary.max_changeset_size, Some(10_000));
        assert_eq!(summary.max_way_nodes, Some(2_000));
        assert_eq!(summary.timeout_seconds, Some(300));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["max_changeset_size"], 10_000);
    }
}
