//! Process-wide configuration: listening port, download directory, and the
//! knobs the event loop's timing depends on.

use std::path::PathBuf;
use std::time::Duration;

/// Settings shared by every torrent the engine drives. Most fields come
/// straight from the spec's constants; they are configurable here so tests
/// can shrink timeouts rather than waiting on real wall-clock time.
pub struct Configuration {
    pub peer_id_prefix: String,
    pub listen_port: u16,
    pub download_dir: PathBuf,
    pub session_file: PathBuf,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub selector_poll_timeout: Duration,
    pub idle_sleep: Duration,
    pub udp_tracker_timeout: Duration,
    pub retry_check_interval: Duration,
    pub max_peer_failures: u32,
    pub connect_parallelism: usize,
    pub tracker_fanout_concurrency: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            peer_id_prefix: "-PC0001-".to_string(),
            listen_port: 6881,
            download_dir: PathBuf::from("."),
            session_file: PathBuf::from("session.json"),
            handshake_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            selector_poll_timeout: Duration::from_secs(1),
            idle_sleep: Duration::from_secs(1),
            udp_tracker_timeout: Duration::from_secs(3),
            retry_check_interval: Duration::from_secs(10),
            max_peer_failures: 5,
            connect_parallelism: 120,
            tracker_fanout_concurrency: 10,
        }
    }
}

/// CLI-facing view of [`Configuration`]; kept separate so `torrentd-core`
/// has no `clap` dependency of its own — the binary crate parses into this
/// and converts.
#[derive(Debug, Clone)]
pub struct ConfigurationArgs {
    pub listen_port: Option<u16>,
    pub download_dir: Option<PathBuf>,
    pub session_file: Option<PathBuf>,
}

impl Configuration {
    pub fn apply(mut self, args: ConfigurationArgs) -> Self {
        if let Some(port) = args.listen_port {
            self.listen_port = port;
        }
        if let Some(dir) = args.download_dir {
            self.download_dir = dir;
        }
        if let Some(file) = args.session_file {
            self.session_file = file;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = Configuration::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(1));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.udp_tracker_timeout, Duration::from_secs(3));
        assert_eq!(config.max_peer_failures, 5);
    }

    #[test]
    fn apply_overrides_only_set_fields() {
        let config = Configuration::default().apply(ConfigurationArgs {
            listen_port: Some(7000),
            download_dir: None,
            session_file: None,
        });
        assert_eq!(config.listen_port, 7000);
        assert_eq!(config.download_dir, PathBuf::from("."));
    }
}
