use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, Bytes, BytesMut};
use crc32fast::Hasher as Crc32;
use multiexit::ExitStatistics;
use prost::Message;

use crate::{config::LoggingConfig, loss::LossSummary, DistillationError};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard_dir.clone(),
            tensorboard_flush_every_n: config.flush_every.max(1),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enable_stdout: false,
            tensorboard_dir: None,
            tensorboard_flush_every_n: 1,
        }
    }
}

/// Per-step loss and exit-statistics sink.
///
/// Write failures on the event file are dropped so metrics never abort a run.
pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, DistillationError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    /// Path of the open event file, if TensorBoard output is enabled.
    pub fn event_file(&self) -> Option<&Path> {
        self.tensorboard.as_ref().map(|writer| writer.path.as_path())
    }

    pub fn log_step(&mut self, step: usize, summary: &LossSummary) {
        if self.settings.enable_stdout {
            let mut line = format!("train step={} loss={:.4}", step, summary.loss);
            if let Some(distill) = summary.distill_loss {
                line.push_str(&format!(" distill={:.4}", distill));
            }
            if let Some(task) = summary.task_loss {
                line.push_str(&format!(" task={:.4}", task));
            }
            println!("{line}");
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = step as i64;
            let mut values = vec![("train/loss".to_string(), summary.loss)];
            if let Some(distill) = summary.distill_loss {
                values.push(("train/distill_loss".to_string(), distill));
            }
            if let Some(task) = summary.task_loss {
                values.push(("train/task_loss".to_string(), task));
            }
            for (idx, value) in summary.stage_distill_losses.iter().enumerate() {
                values.push((format!("train/stage_{}/distill_loss", idx + 1), *value));
            }
            for (idx, value) in summary.stage_task_losses.iter().enumerate() {
                values.push((format!("train/stage_{}/task_loss", idx + 1), *value));
            }
            let _ = writer.write_scalars(step, &values);
        }
    }

    pub fn log_exit_statistics(&mut self, step: usize, stats: &ExitStatistics) {
        let average_depth = stats.average_depth();
        let cost_ratio = stats.cost_ratio();
        if self.settings.enable_stdout {
            println!(
                "eval step={} examples={} avg_depth={:.2} cost={:.2}% exits={:?}",
                step,
                stats.total(),
                average_depth,
                cost_ratio * 100.0,
                stats.counts()
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = step as i64;
            let total = stats.total().max(1) as f32;
            let mut values = vec![
                ("exit/average_depth".to_string(), average_depth as f32),
                ("exit/cost_ratio".to_string(), cost_ratio as f32),
                ("exit/compute_saving".to_string(), stats.compute_saving() as f32),
            ];
            for (idx, count) in stats.counts().iter().enumerate() {
                values.push((format!("exit/stage_{}/fraction", idx + 1), *count as f32 / total));
            }
            let _ = writer.write_scalars(step, &values);
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

struct TensorBoardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, DistillationError> {
        fs::create_dir_all(dir).map_err(|err| {
            DistillationError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let path = dir.join(format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        ));
        let file = File::create(&path).map_err(|err| {
            DistillationError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        log::info!("writing tensorboard events to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    /// Writes all `values` as one summary event.
    fn write_scalars(&mut self, step: i64, values: &[(String, f32)]) -> Result<(), DistillationError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: values
                    .iter()
                    .map(|(tag, value)| summary::Value {
                        tag: tag.clone(),
                        simple_value: Some(*value),
                    })
                    .collect(),
            }),
        };
        let record = frame_record(&event.encode_to_vec());
        self.writer.write_all(&record).map_err(|err| {
            DistillationError::runtime(format!("failed to write tensorboard event: {err}"))
        })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DistillationError> {
        self.writer.flush().map_err(|err| {
            DistillationError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// TFRecord framing: length, masked CRC of the length, payload, masked CRC
/// of the payload, all little-endian.
fn frame_record(payload: &[u8]) -> Bytes {
    let len = (payload.len() as u64).to_le_bytes();
    let mut record = BytesMut::with_capacity(payload.len() + 16);
    record.put_slice(&len);
    record.put_u32_le(masked_crc32(&len));
    record.put_slice(payload);
    record.put_u32_le(masked_crc32(payload));
    record.freeze()
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_events(path: &Path) -> anyhow::Result<Vec<Event>> {
        let data = fs::read(path)?;
        let mut events = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&data[offset..offset + 8]);
            let len = u64::from_le_bytes(len_bytes) as usize;
            let len_crc = u32::from_le_bytes(data[offset + 8..offset + 12].try_into()?);
            assert_eq!(len_crc, masked_crc32(&len_bytes));
            let payload = &data[offset + 12..offset + 12 + len];
            let data_crc = u32::from_le_bytes(data[offset + 12 + len..offset + 16 + len].try_into()?);
            assert_eq!(data_crc, masked_crc32(payload));
            events.push(Event::decode(payload)?);
            offset += 16 + len;
        }
        Ok(events)
    }

    #[test]
    fn frames_records_with_checksums() {
        let record = frame_record(b"abc");
        assert_eq!(record.len(), 3 + 16);
        assert_eq!(&record[..8], &3u64.to_le_bytes());
        assert_eq!(&record[12..15], b"abc");
    }

    #[test]
    fn writes_loss_and_exit_events() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let settings = LoggingSettings {
            enable_stdout: false,
            tensorboard_dir: Some(tmp.path().join("tb")),
            tensorboard_flush_every_n: 100,
        };
        let mut logger = Logger::new(settings)?;
        let path = logger
            .event_file()
            .ok_or_else(|| anyhow::anyhow!("no event file"))?
            .to_path_buf();

        let summary = LossSummary {
            loss: 1.5,
            distill_loss: Some(1.0),
            task_loss: Some(0.5),
            stage_distill_losses: vec![0.2, 0.4],
            stage_task_losses: vec![0.1, 0.2],
        };
        logger.log_step(3, &summary);
        let mut stats = ExitStatistics::new(2);
        stats.record(1, 3);
        stats.record(2, 1);
        logger.log_exit_statistics(3, &stats);
        logger.flush();

        let events = read_events(&path)?;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.step == 3));

        let tags: Vec<String> = events[0]
            .summary
            .as_ref()
            .map(|s| s.value.iter().map(|v| v.tag.clone()).collect())
            .unwrap_or_default();
        assert_eq!(tags.len(), 7);
        assert!(tags.contains(&"train/stage_2/distill_loss".to_string()));

        let exits = events[1]
            .summary
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("missing summary"))?;
        let fraction = exits
            .value
            .iter()
            .find(|v| v.tag == "exit/stage_1/fraction")
            .and_then(|v| v.simple_value);
        assert_eq!(fraction, Some(0.75));
        Ok(())
    }

    #[test]
    fn disabled_logger_writes_nothing() -> anyhow::Result<()> {
        let mut logger = Logger::new(LoggingSettings::disabled())?;
        assert!(logger.event_file().is_none());
        logger.log_step(0, &LossSummary::default());
        logger.flush();
        Ok(())
    }
}
