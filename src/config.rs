//! Server configuration
//!
//! The full option surface with its defaults, loaded in precedence order:
//! CLI flags over environment (`LIVEHUB_*`) over the config file over the
//! built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One configured application (the `app` part of a stream key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub appname: String,
    /// Publishing into this app is allowed.
    #[serde(default)]
    pub live: bool,
    /// Feed the HLS segmenter.
    #[serde(default)]
    pub hls: bool,
    /// Allow HTTP-FLV playback and FLV recording.
    #[serde(default)]
    pub flv: bool,
    /// Expose this app through the admin API.
    #[serde(default)]
    pub api: bool,
    /// Upstream RTMP destinations to relay every publish to.
    #[serde(default)]
    pub static_push: Vec<String>,
}

/// JWT settings for the admin API collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Jwt {
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub algorithm: String,
}

/// Complete server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log level filter.
    pub level: String,

    pub rtmp_addr: String,
    pub httpflv_addr: String,
    pub hls_addr: String,
    pub api_addr: String,

    /// Skip the publish-key check in the auth collaborator.
    pub rtmp_noauth: bool,
    /// Retain the HLS playlist after the publisher leaves.
    pub hls_keep_after_end: bool,

    /// Record each session to FLV.
    pub flv_archive: bool,
    /// Convert finished recordings to MP4.
    pub archive_mp4: bool,
    /// One file per key, overwritten on re-publish, instead of one file
    /// per session.
    pub archive_singleton: bool,
    pub flv_dir: PathBuf,
    pub archive_dir: PathBuf,

    /// Publisher idle timeout, seconds.
    pub read_timeout: u64,
    /// Sink writer idle timeout, seconds.
    pub write_timeout: u64,
    /// GOP ring size of the subscriber prelude cache.
    pub gop_num: usize,

    pub jwt: Jwt,
    pub server: Vec<Application>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            rtmp_addr: ":1935".into(),
            httpflv_addr: ":7001".into(),
            hls_addr: ":7002".into(),
            api_addr: ":8090".into(),
            rtmp_noauth: false,
            hls_keep_after_end: false,
            flv_archive: false,
            archive_mp4: false,
            archive_singleton: false,
            flv_dir: PathBuf::from("tmp"),
            archive_dir: PathBuf::from("tmp"),
            read_timeout: 10,
            write_timeout: 10,
            gop_num: 1,
            jwt: Jwt::default(),
            server: vec![Application {
                appname: "live".into(),
                live: true,
                hls: true,
                flv: true,
                api: true,
                static_push: Vec::new(),
            }],
        }
    }
}

impl Settings {
    /// Load settings: defaults, then the config file (if present), then
    /// `LIVEHUB_*` environment variables.
    pub fn load(config_file: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?)
            .add_source(config::File::with_name(config_file).required(false))
            .add_source(config::Environment::with_prefix("LIVEHUB"))
            .build()?;
        Ok(builder.try_deserialize()?)
    }

    /// Load settings and apply CLI overrides on top.
    pub fn load_with_args(args: &Args) -> Result<Self> {
        let mut settings = Self::load(&args.config_file)?;
        args.apply(&mut settings);
        Ok(settings)
    }

    /// Look up an application entry by name.
    pub fn app(&self, appname: &str) -> Option<&Application> {
        self.server.iter().find(|a| a.appname == appname)
    }

    /// Whether publishing into the app is allowed.
    pub fn app_enabled(&self, appname: &str) -> bool {
        self.app(appname).map(|a| a.live).unwrap_or(false)
    }

    /// Upstream destinations for one app. Resolved per app name on every
    /// call; apps with distinct push lists never bleed into each other.
    pub fn static_push_urls(&self, appname: &str) -> Vec<String> {
        self.app(appname)
            .filter(|a| a.live)
            .map(|a| a.static_push.clone())
            .unwrap_or_default()
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }
}

/// Command-line overrides, highest precedence.
#[derive(Debug, Clone, Parser, Default)]
#[command(name = "livehub", about = "Live-stream relay hub")]
pub struct Args {
    /// Configuration file.
    #[arg(long, default_value = "livehub.yaml")]
    pub config_file: String,

    /// RTMP server listen address.
    #[arg(long)]
    pub rtmp_addr: Option<String>,

    /// HTTP-FLV server listen address.
    #[arg(long)]
    pub httpflv_addr: Option<String>,

    /// HLS server listen address.
    #[arg(long)]
    pub hls_addr: Option<String>,

    /// Admin API listen address.
    #[arg(long)]
    pub api_addr: Option<String>,

    /// Log level.
    #[arg(long)]
    pub level: Option<String>,

    /// Output FLV recordings under this directory.
    #[arg(long)]
    pub flv_dir: Option<PathBuf>,

    /// Keep the HLS playlist after the stream ends.
    #[arg(long)]
    pub hls_keep_after_end: bool,

    /// Publisher idle timeout in seconds.
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Sink writer idle timeout in seconds.
    #[arg(long)]
    pub write_timeout: Option<u64>,

    /// Prelude cache GOP count.
    #[arg(long)]
    pub gop_num: Option<usize>,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(v) = &self.rtmp_addr {
            settings.rtmp_addr = v.clone();
        }
        if let Some(v) = &self.httpflv_addr {
            settings.httpflv_addr = v.clone();
        }
        if let Some(v) = &self.hls_addr {
            settings.hls_addr = v.clone();
        }
        if let Some(v) = &self.api_addr {
            settings.api_addr = v.clone();
        }
        if let Some(v) = &self.level {
            settings.level = v.clone();
        }
        if let Some(v) = &self.flv_dir {
            settings.flv_dir = v.clone();
        }
        if self.hls_keep_after_end {
            settings.hls_keep_after_end = true;
        }
        if let Some(v) = self.read_timeout {
            settings.read_timeout = v;
        }
        if let Some(v) = self.write_timeout {
            settings.write_timeout = v;
        }
        if let Some(v) = self.gop_num {
            settings.gop_num = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_shipping_config() {
        let settings = Settings::default();

        assert_eq!(settings.rtmp_addr, ":1935");
        assert_eq!(settings.httpflv_addr, ":7001");
        assert_eq!(settings.hls_addr, ":7002");
        assert_eq!(settings.api_addr, ":8090");
        assert_eq!(settings.read_timeout, 10);
        assert_eq!(settings.write_timeout, 10);
        assert_eq!(settings.gop_num, 1);
        assert!(!settings.flv_archive);

        let live = settings.app("live").unwrap();
        assert!(live.live && live.hls && live.flv);
        assert!(settings.app_enabled("live"));
        assert!(!settings.app_enabled("vod"));
    }

    #[test]
    fn test_static_push_is_per_app() {
        let mut settings = Settings::default();
        settings.server.push(Application {
            appname: "events".into(),
            live: true,
            hls: false,
            flv: false,
            api: false,
            static_push: vec!["rtmp://up1/live/a".into(), "rtmp://up2/live/a".into()],
        });

        assert!(settings.static_push_urls("live").is_empty());
        assert_eq!(settings.static_push_urls("events").len(), 2);
        assert!(settings.static_push_urls("unknown").is_empty());
    }

    #[test]
    fn test_disabled_app_has_no_push_urls() {
        let mut settings = Settings::default();
        settings.server.push(Application {
            appname: "off".into(),
            live: false,
            hls: false,
            flv: false,
            api: false,
            static_push: vec!["rtmp://up1/live/a".into()],
        });

        assert!(settings.static_push_urls("off").is_empty());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "rtmp_addr: \":2935\"\ngop_num: 4\nserver:\n  - appname: show\n    live: true\n    flv: true"
        )
        .unwrap();

        let settings = Settings::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(settings.rtmp_addr, ":2935");
        assert_eq!(settings.gop_num, 4);
        assert!(settings.app_enabled("show"));
        // Untouched keys keep their defaults.
        assert_eq!(settings.httpflv_addr, ":7001");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let settings = Settings::load("/nonexistent/livehub.yaml").unwrap();
        assert_eq!(settings.rtmp_addr, ":1935");
    }

    #[test]
    fn test_cli_overrides_win() {
        let args = Args {
            config_file: "/nonexistent/livehub.yaml".into(),
            rtmp_addr: Some(":3935".into()),
            read_timeout: Some(30),
            ..Default::default()
        };

        let settings = Settings::load_with_args(&args).unwrap();
        assert_eq!(settings.rtmp_addr, ":3935");
        assert_eq!(settings.read_timeout, 30);
        assert_eq!(settings.read_timeout(), Duration::from_secs(30));
    }
}
