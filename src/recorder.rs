// ===============================
// src/recorder.rs
// ===============================
//
// Append-only JSONL audit trail of batches:
// - One AuditEvent per line (append).
// - BufWriter to save syscalls.
// - Flush every 1s and/or every 100 events, and on channel close.
// - Parent directory is created if missing.
// - On a write error the file is reopened once and the line retried.
//
// ENV: `RECORD_FILE=/path/to/audit.jsonl` enables it (see main.rs).
//
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::AuditEvent;

const FLUSH_EVERY_N_EVENTS: u32 = 100;

/// Handle the orchestrator writes through. Never blocks a batch.
#[derive(Debug, Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditSink {
    pub fn new(tx: mpsc::Sender<AuditEvent>) -> Self {
        Self { tx }
    }

    pub fn record(&self, ev: AuditEvent) {
        if let Err(e) = self.tx.try_send(ev) {
            warn!(error = %e, "recorder: event dropped");
        }
    }
}

pub async fn open_writer(path: &str) -> std::io::Result<BufWriter<tokio::fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(BufWriter::new(file))
}

async fn write_line(
    writer: &mut BufWriter<tokio::fs::File>,
    line: &str,
) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

/// Drains `rx` into `writer` until every sender is dropped.
pub async fn run(
    mut rx: mpsc::Receiver<AuditEvent>,
    mut writer: BufWriter<tokio::fs::File>,
    path: String,
) {
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };

                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(w) => writer = w,
                        Err(e) => {
                            error!(?e, "recorder: reopen failed, drop event");
                            continue;
                        }
                    }
                    if let Err(e2) = write_line(&mut writer, &line).await {
                        error!(?e2, "recorder: write failed again after reopen, drop event");
                        continue;
                    }
                }

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}
