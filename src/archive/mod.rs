//! MP4 archiving
//!
//! Finished FLV recordings are handed to a single background worker that
//! remuxes them to MP4 with the external `ffmpeg` binary, one at a time.
//! Conversion writes to a temp file and renames into place, so a partial
//! output never carries the final name. Failures are logged and the FLV
//! is retained; live serving never depends on any of this.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Bounded depth of the conversion queue.
pub const ARCHIVE_QUEUE_CAPACITY: usize = 100;

/// One conversion request.
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Handle to the background conversion worker.
pub struct Mp4Archiver {
    jobs: mpsc::Sender<ArchiveJob>,
}

impl Mp4Archiver {
    /// Spawn the worker with the default queue depth.
    pub fn spawn() -> Arc<Self> {
        Self::with_capacity(ARCHIVE_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (jobs, rx) = mpsc::channel(capacity);
        tokio::spawn(worker(rx));
        Arc::new(Self { jobs })
    }

    /// Queue a finished recording. Never blocks; a full queue drops the
    /// job with a warning and the FLV stays on disk.
    pub fn enqueue(&self, input: PathBuf, output: PathBuf) {
        let job = ArchiveJob { input, output };
        if let Err(e) = self.jobs.try_send(job) {
            tracing::warn!(error = %e, "Archive queue full, conversion skipped");
        }
    }
}

/// The MP4 path for a recording: `.mp4` appended next to the FLV.
pub fn mp4_output_path(input: &Path) -> PathBuf {
    let mut os = input.as_os_str().to_os_string();
    os.push(".mp4");
    PathBuf::from(os)
}

async fn worker(mut jobs: mpsc::Receiver<ArchiveJob>) {
    while let Some(job) = jobs.recv().await {
        tracing::debug!(input = %job.input.display(), "MP4 conversion starting");
        match convert(&job).await {
            Ok(()) => {
                tracing::info!(output = %job.output.display(), "MP4 conversion finished")
            }
            Err(e) => tracing::error!(
                input = %job.input.display(),
                error = %e,
                "MP4 conversion failed, FLV retained"
            ),
        }
    }
}

async fn convert(job: &ArchiveJob) -> Result<()> {
    let mut temp = job.input.as_os_str().to_os_string();
    temp.push("_temp.mp4");
    let temp = PathBuf::from(temp);

    let status = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(&job.input)
        .args(["-codec", "copy", "-movflags", "+faststart"])
        .arg(&temp)
        .status()
        .await?;
    if !status.success() {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(Error::Archive(format!("ffmpeg exited with {status}")));
    }

    tokio::fs::rename(&temp, &job.output).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mp4_path_appends_extension() {
        let out = mp4_output_path(Path::new("/tmp/live/movie_170.flv"));
        assert_eq!(out, PathBuf::from("/tmp/live/movie_170.flv.mp4"));
    }

    #[tokio::test]
    async fn test_enqueue_never_blocks_when_full() {
        let archiver = Mp4Archiver::with_capacity(1);

        // The worker may be busy failing on the first job; the rest must
        // drop without blocking this task.
        for i in 0..10 {
            let input = PathBuf::from(format!("/nonexistent/{i}.flv"));
            let output = mp4_output_path(&input);
            archiver.enqueue(input, output);
        }
    }

    #[tokio::test]
    async fn test_missing_input_is_logged_not_fatal() {
        let job = ArchiveJob {
            input: PathBuf::from("/nonexistent/in.flv"),
            output: PathBuf::from("/nonexistent/in.flv.mp4"),
        };
        // Either ffmpeg is absent (spawn error) or it exits non-zero;
        // both surface as an error, never a panic.
        assert!(convert(&job).await.is_err());
    }
}
