// 该文件是 Yingyang （营养） 项目的一部分。
// src/task.rs - 单次与连续处理任务
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::sync::Arc;
use std::{thread, time::Duration};

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use crate::input::Submission;
use crate::intake::{IntakeLedger, IntakeRecord, QuantityHints};
use crate::output::Render;
use crate::pipeline::{CancelFlag, IntakeRequest, Pipeline};

pub trait Task<I, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, pipeline: &Pipeline, output: O) -> Result<Self::Output, Self::Error>;
}

/// 只处理第一张图像
pub struct OneShotTask {
  user_id: String,
  hints: QuantityHints,
}

impl OneShotTask {
  pub fn new(user_id: impl Into<String>) -> Self {
    Self {
      user_id: user_id.into(),
      hints: QuantityHints::default(),
    }
  }

  pub fn with_hints(mut self, hints: QuantityHints) -> Self {
    self.hints = hints;
    self
  }
}

impl<RE, I, O> Task<I, O> for OneShotTask
where
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = Submission>,
  O: Render<Submission, IntakeRecord, Error = RE>,
{
  type Output = IntakeRecord;
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, pipeline: &Pipeline, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let submission = input.next().ok_or_else(|| anyhow::anyhow!("没有输入图像"))?;
    info!("读取 {} 成功，开始处理...", submission.name);
    let now = std::time::Instant::now();
    let request = IntakeRequest::new(Arc::clone(&submission.bytes), self.user_id, Utc::now())
      .with_hints(self.hints);
    let record = pipeline.run_with(request, &CancelFlag::new())?;
    let elapsed = now.elapsed();
    info!("处理完成，耗时: {:.2?}", elapsed);
    output.render_result(&submission, &record)?;
    info!("输出完成，耗时: {:.2?}", now.elapsed());

    Ok(record)
  }
}

/// 逐张处理直到输入耗尽、达到帧数上限或被中断
///
/// 单张图像失败只记录日志，不终止任务；每条记录入账到当日汇总。
pub struct ContinuousTask {
  user_id: String,
  frame_number: Option<usize>,
  ledger: Arc<IntakeLedger>,
  cancel: CancelFlag,
}

impl ContinuousTask {
  pub fn new(user_id: impl Into<String>) -> Self {
    Self {
      user_id: user_id.into(),
      frame_number: None,
      ledger: Arc::new(IntakeLedger::new()),
      cancel: CancelFlag::new(),
    }
  }

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_ledger(mut self, ledger: Arc<IntakeLedger>) -> Self {
    self.ledger = ledger;
    self
  }

  pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
    self.cancel = cancel;
    self
  }

  /// 安装 Ctrl-C 处理：首次触发取消当前任务，30 秒后仍未退出则强制退出
  pub fn with_ctrl_c(self) -> anyhow::Result<Self> {
    let cancel = self.cancel.clone();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      cancel.cancel();
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
    .context("无法设置 Ctrl-C 处理函数")?;
    Ok(self)
  }
}

/// 连续任务的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContinuousReport {
  pub processed: usize,
  pub failed: usize,
}

impl<RE, I, O> Task<I, O> for ContinuousTask
where
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = Submission>,
  O: Render<Submission, IntakeRecord, Error = RE>,
{
  type Output = ContinuousReport;
  type Error = anyhow::Error;

  fn run_task(self, input: I, pipeline: &Pipeline, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let mut report = ContinuousReport::default();

    for submission in input {
      if self.cancel.is_cancelled() {
        warn!("中断信号接收，退出任务循环");
        break;
      }

      let frame_index = report.processed + report.failed + 1;
      info!("处理第 {} 张图像: {}", frame_index, submission.name);
      let now = std::time::Instant::now();
      let request = IntakeRequest::new(Arc::clone(&submission.bytes), self.user_id.clone(), Utc::now());

      match pipeline.run_with(request, &self.cancel) {
        Ok(record) => {
          let elapsed_a = now.elapsed();
          output.render_result(&submission, &record)?;
          let summary = self.ledger.commit(&record)?;
          let elapsed_b = now.elapsed();
          info!("处理完成，耗时: {:.2?} / {:.2?}", elapsed_a, elapsed_b);
          info!(
            "{} 当日累计 {} 条记录: {:?}",
            summary.date, summary.record_count, summary.totals
          );
          report.processed += 1;
        }
        Err(e) => {
          warn!("{} 处理失败: {}", submission.name, e);
          report.failed += 1;
        }
      }

      if self.frame_number.map(|n| frame_index >= n).unwrap_or(false) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
    }

    info!(
      "任务完成，成功 {} 张，失败 {} 张",
      report.processed, report.failed
    );
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::catalog::CatalogHandle;
  use crate::catalog::tests::fruit_catalog;
  use crate::config::PipelineConfig;
  use crate::detector::{BoundingBox, Detect, DetectResult, DetectionPolicy, Detection, InferenceError};
  use crate::frame::FrameError;
  use std::sync::Mutex;
  use thiserror::Error;

  /// 字节内容即标签，空字节视为无法解码
  struct ByteLabel;

  impl Detect for ByteLabel {
    fn detect(&self, image: &[u8], _policy: &DetectionPolicy) -> Result<DetectResult, InferenceError> {
      if image.is_empty() {
        return Err(InferenceError::Decode(FrameError::Empty));
      }
      let label = String::from_utf8_lossy(image).into_owned();
      let detection = Detection::new(label, 0.9, BoundingBox::from([0.0, 0.0, 1.0, 1.0])).unwrap();
      Ok(DetectResult {
        items: vec![detection],
        image_width: 1,
        image_height: 1,
        elapsed: Duration::ZERO,
        candidates: 1,
      })
    }
  }

  #[derive(Debug, Error)]
  #[error("sink closed")]
  struct SinkClosed;

  #[derive(Default)]
  struct Collect(Mutex<Vec<String>>);

  impl Render<Submission, IntakeRecord> for &Collect {
    type Error = SinkClosed;

    fn render_result(&self, frame: &Submission, _result: &IntakeRecord) -> Result<(), SinkClosed> {
      self.0.lock().unwrap().push(frame.name.clone());
      Ok(())
    }
  }

  fn pipeline() -> Pipeline {
    Pipeline::builder()
      .detector(Arc::new(ByteLabel))
      .catalog(CatalogHandle::new(fruit_catalog()))
      .config(&PipelineConfig::default())
      .build()
      .unwrap()
  }

  fn submissions(labels: &[&str]) -> Vec<Submission> {
    labels
      .iter()
      .enumerate()
      .map(|(i, label)| Submission {
        name: format!("{}.png", i),
        bytes: label.as_bytes().to_vec().into(),
      })
      .collect()
  }

  #[test]
  fn one_shot_processes_first_submission() {
    let sink = Collect::default();
    let record = OneShotTask::new("u1")
      .with_hints(QuantityHints::new().with(0, 2.0))
      .run_task(submissions(&["apple", "banana"]).into_iter(), &pipeline(), &sink)
      .unwrap();
    assert_eq!(record.totals["calories"], 190.0);
    assert_eq!(*sink.0.lock().unwrap(), vec!["0.png".to_string()]);
  }

  #[test]
  fn one_shot_without_input_fails() {
    let sink = Collect::default();
    assert!(
      OneShotTask::new("u1")
        .run_task(Vec::<Submission>::new().into_iter(), &pipeline(), &sink)
        .is_err()
    );
  }

  #[test]
  fn continuous_folds_into_ledger_and_skips_failures() {
    let sink = Collect::default();
    let ledger = Arc::new(IntakeLedger::new());
    let report = ContinuousTask::new("u1")
      .with_ledger(Arc::clone(&ledger))
      .run_task(submissions(&["apple", "", "banana"]).into_iter(), &pipeline(), &sink)
      .unwrap();

    assert_eq!(report, ContinuousReport { processed: 2, failed: 1 });
    assert_eq!(sink.0.lock().unwrap().len(), 2);
    let summaries = ledger.summaries_for("u1").unwrap();
    assert_eq!(summaries.iter().map(|s| s.record_count).sum::<u64>(), 2);
    let calories: f64 = summaries.iter().map(|s| s.totals["calories"]).sum();
    assert_eq!(calories, 200.0);
    assert_eq!(ledger.record_count().unwrap(), 2);
  }

  #[test]
  fn continuous_respects_frame_limit_and_cancel() {
    let sink = Collect::default();
    let report = ContinuousTask::new("u1")
      .with_frame_number(Some(1))
      .run_task(submissions(&["apple", "banana"]).into_iter(), &pipeline(), &sink)
      .unwrap();
    assert_eq!(report.processed, 1);

    let cancel = CancelFlag::new();
    cancel.cancel();
    let report = ContinuousTask::new("u1")
      .with_cancel(cancel)
      .run_task(submissions(&["apple"]).into_iter(), &pipeline(), &sink)
      .unwrap();
    assert_eq!(report, ContinuousReport::default());
  }
}
