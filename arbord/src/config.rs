//! Daemon configuration, loaded from a TOML file and overridable from the
//! command line.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Top-level `arbord` configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ArbordConfig {
    /// Overlay shape.
    pub overlay: OverlaySection,
    /// Job execution settings.
    pub exec: ExecSection,
    /// Log filtering.
    pub tracing: TracingSection,
}

/// The `[overlay]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OverlaySection {
    /// Number of ranks in the tree.
    pub size: u32,
    /// Tree fan-out.
    pub fanout: u32,
}

impl Default for OverlaySection {
    fn default() -> OverlaySection {
        OverlaySection { size: 1, fanout: 2 }
    }
}

/// The `[exec]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExecSection {
    /// The job-shell program run on each hosting rank.
    pub job_shell: PathBuf,
    /// Responder coalescing interval, in milliseconds.
    pub flush_interval_ms: u64,
}

impl Default for ExecSection {
    fn default() -> ExecSection {
        ExecSection {
            job_shell: PathBuf::from("arbor-job-shell"),
            flush_interval_ms: 20,
        }
    }
}

/// The `[tracing]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TracingSection {
    /// Default `tracing` filter; `RUST_LOG` overrides it.
    pub filter: String,
}

impl Default for TracingSection {
    fn default() -> TracingSection {
        TracingSection {
            filter: "info".to_string(),
        }
    }
}

impl ExecSection {
    /// The coordinator configuration this section describes.
    pub fn coordinator_config(&self) -> arbor_coord::Config {
        arbor_coord::Config {
            job_shell: self.job_shell.clone(),
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        arbor_test::init();

        let config: ArbordConfig = toml::from_str("").expect("parses");
        assert_eq!(config.overlay.size, 1);
        assert_eq!(config.exec.flush_interval_ms, 20);
        assert_eq!(config.tracing.filter, "info");
    }

    #[test]
    fn sections_parse() {
        arbor_test::init();

        let config: ArbordConfig = toml::from_str(
            r#"
            [overlay]
            size = 7
            fanout = 2

            [exec]
            job_shell = "/usr/libexec/arbor/job-shell"
            flush_interval_ms = 10

            [tracing]
            filter = "arbor_coord=debug"
            "#,
        )
        .expect("parses");
        assert_eq!(config.overlay.size, 7);
        assert_eq!(
            config.exec.job_shell,
            PathBuf::from("/usr/libexec/arbor/job-shell")
        );
        assert_eq!(config.tracing.filter, "arbor_coord=debug");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        arbor_test::init();

        assert!(toml::from_str::<ArbordConfig>("[overlay]\nsize = 1\nshape = 3\n").is_err());
    }
}
