//! Publish-time orchestration
//!
//! The protocol front ends (RTMP ingest, HTTP-FLV, HLS) talk to this
//! service instead of wiring sinks themselves. On publish it gates on the
//! app configuration and attaches the configured consumers: the FLV
//! recorder and the static-push uplinks. Play requests resolve the
//! subscriber rendezvous and hand back a ready sink.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::archive::Mp4Archiver;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::media::Info;
use crate::relay::{StaticPushRegistry, UplinkConnector};
use crate::sinks::{ChunkWriter, FlvFileSink, HlsSink, HttpFlvSink, RtmpPlayerSink, Segmenter};

use super::registry::StreamRegistry;
use super::stream::{Publisher, StreamConfig};

/// The hub's public face: registries plus the configuration that decides
/// what gets attached to each publish.
pub struct StreamService {
    settings: Settings,
    registry: Arc<StreamRegistry>,
    static_push: Arc<StaticPushRegistry>,
    archiver: Option<Arc<Mp4Archiver>>,
}

impl StreamService {
    pub fn new(settings: Settings, connector: Arc<dyn UplinkConnector>) -> Self {
        let registry = Arc::new(StreamRegistry::new(StreamConfig {
            read_timeout: settings.read_timeout(),
            gop_num: settings.gop_num,
        }));
        let static_push = Arc::new(StaticPushRegistry::new(
            connector,
            settings.write_timeout(),
        ));
        let archiver =
            (settings.flv_archive && settings.archive_mp4).then(Mp4Archiver::spawn);
        Self {
            settings,
            registry,
            static_push,
            archiver,
        }
    }

    /// Start a publish session: claim the key, then attach the recorder
    /// and every configured uplink. Attachment failures are logged and
    /// local; the publish itself only fails on key or app problems.
    pub async fn start_publish(&self, url: &str, key: &str) -> Result<Publisher> {
        let info = Info::new(url, key)?;
        let app = info.app().to_string();
        let Some(app_config) = self.settings.app(&app).filter(|a| a.live) else {
            return Err(Error::AppDisabled(app));
        };

        let publisher = self.registry.publish(info.clone()).await?;

        if self.settings.flv_archive && app_config.flv {
            match FlvFileSink::create(
                &info,
                &self.settings.flv_dir,
                self.settings.archive_singleton,
                self.settings.write_timeout(),
                self.archiver.clone(),
            )
            .await
            {
                Ok(recorder) => {
                    if let Err(e) = publisher.handle().add_sink(recorder) {
                        tracing::error!(stream = %key, error = %e, "Recorder attach failed");
                    }
                }
                Err(e) => {
                    tracing::error!(stream = %key, error = %e, "Recorder open failed")
                }
            }
        }

        for push_url in self.settings.static_push_urls(&app) {
            let push = match self.static_push.get_or_create(&push_url).await {
                Ok(push) => push,
                Err(e) => {
                    tracing::error!(uplink = %push_url, error = %e, "Bad push url, skipped");
                    continue;
                }
            };
            match push.start().await {
                Ok(()) | Err(Error::AlreadyStarted(_)) => {}
                Err(e) => {
                    tracing::error!(uplink = %push_url, error = %e, "Uplink start failed, skipped");
                    continue;
                }
            }
            if let Err(e) = publisher.handle().add_sink(push) {
                tracing::error!(uplink = %push_url, error = %e, "Uplink attach failed");
            }
        }

        Ok(publisher)
    }

    /// End a publish session: close the stream and release the app's
    /// uplinks.
    pub async fn stop_publish(&self, key: &str) {
        if let Ok(handle) = self.registry.subscriber_target(key).await {
            handle.close();
        }
        let app = key.split('/').next().unwrap_or("");
        for push_url in self.settings.static_push_urls(app) {
            self.static_push.stop(&push_url).await;
        }
    }

    /// Attach an RTMP player to a live stream.
    pub async fn play_rtmp(
        &self,
        url: &str,
        key: &str,
        writer: Box<dyn ChunkWriter>,
        stream_id: u32,
    ) -> Result<Arc<RtmpPlayerSink>> {
        let info = Info::new(url, key)?;
        self.require_app(info.app(), |_| true)?;
        let target = self.registry.subscriber_target(key).await?;
        let sink = RtmpPlayerSink::spawn(info, writer, stream_id, self.settings.write_timeout());
        target.add_sink(sink.clone())?;
        Ok(sink)
    }

    /// Attach an HTTP-FLV subscriber to a live stream.
    pub async fn play_http_flv(
        &self,
        url: &str,
        key: &str,
        body: mpsc::Sender<Bytes>,
    ) -> Result<Arc<HttpFlvSink>> {
        let info = Info::new(url, key)?;
        self.require_app(info.app(), |a| a.flv)?;
        let target = self.registry.subscriber_target(key).await?;
        let sink = HttpFlvSink::spawn(info, body, self.settings.write_timeout());
        target.add_sink(sink.clone())?;
        Ok(sink)
    }

    /// Attach the HLS segmenter feed to a live stream.
    pub async fn attach_hls(
        &self,
        key: &str,
        segmenter: Box<dyn Segmenter>,
    ) -> Result<Arc<HlsSink>> {
        let info = Info::new(format!("hls://{key}"), key)?;
        self.require_app(info.app(), |a| a.hls)?;
        let target = self.registry.subscriber_target(key).await?;
        let sink = HlsSink::spawn(
            info,
            segmenter,
            self.settings.hls_keep_after_end,
            self.settings.write_timeout(),
        );
        target.add_sink(sink.clone())?;
        Ok(sink)
    }

    fn require_app<F>(&self, app: &str, enabled: F) -> Result<()>
    where
        F: Fn(&crate::config::Application) -> bool,
    {
        match self.settings.app(app) {
            Some(config) if config.live && enabled(config) => Ok(()),
            _ => Err(Error::AppDisabled(app.to_string())),
        }
    }

    /// Spawn the registry GC with the default sweep interval.
    pub fn spawn_gc(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        self.registry.spawn_gc_task(interval)
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn static_push(&self) -> &Arc<StaticPushRegistry> {
        &self.static_push
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
