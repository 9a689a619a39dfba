// 该文件是 Yingyang （营养） 项目的一部分。
// src/pipeline.rs - 检测 → 对齐 → 汇总流水线
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

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::catalog::{CatalogError, CatalogHandle};
use crate::config::PipelineConfig;
use crate::detector::{Detect, DetectResult, DetectionPolicy, InferenceError};
use crate::error::StartupError;
use crate::intake::{AggregationError, Aggregator, IntakeRecord, QuantityHints};
use crate::reconcile::{ReconcileError, Reconciler};

/// 等待检测结果时检查取消标志的间隔
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
  Detection,
  Reconciliation,
  Aggregation,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Stage::Detection => write!(f, "detection"),
      Stage::Reconciliation => write!(f, "reconciliation"),
      Stage::Aggregation => write!(f, "aggregation"),
    }
  }
}

#[derive(Error, Debug)]
pub enum StageError {
  #[error("{0}")]
  Inference(#[from] InferenceError),
  #[error("{0}")]
  Reconciliation(#[from] ReconcileError),
  #[error("{0}")]
  Aggregation(#[from] AggregationError),
  #[error("超时 ({0:?})")]
  Timeout(Duration),
  #[error("已取消")]
  Cancelled,
  #[error("检测线程异常: {0}")]
  Worker(String),
}

/// 单次请求的失败，标明出错的阶段
#[derive(Error, Debug)]
#[error("{stage} 阶段失败: {cause}")]
pub struct PipelineError {
  pub stage: Stage,
  #[source]
  pub cause: StageError,
}

impl PipelineError {
  fn at(stage: Stage) -> impl FnOnce(StageError) -> Self {
    move |cause| PipelineError { stage, cause }
  }
}

/// 协作式取消标志，可在任意线程上触发
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// 检测线程名额
///
/// 名额随工作线程一起移动，线程结束（包括被放弃后自然结束）时归还。
#[derive(Debug)]
struct DetectionSlots {
  in_flight: AtomicUsize,
  limit: usize,
}

struct SlotGuard(Arc<DetectionSlots>);

impl DetectionSlots {
  fn new(limit: usize) -> Arc<Self> {
    Arc::new(Self {
      in_flight: AtomicUsize::new(0),
      limit,
    })
  }

  fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
    self
      .in_flight
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < self.limit).then_some(n + 1))
      .ok()
      .map(|_| SlotGuard(Arc::clone(self)))
  }
}

impl Drop for SlotGuard {
  fn drop(&mut self) {
    self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
  }
}

#[derive(Debug, Clone)]
pub struct IntakeRequest {
  pub image: Arc<[u8]>,
  pub user_id: String,
  pub timestamp: DateTime<Utc>,
  pub hints: QuantityHints,
}

impl IntakeRequest {
  pub fn new(image: impl Into<Arc<[u8]>>, user_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
    Self {
      image: image.into(),
      user_id: user_id.into(),
      timestamp,
      hints: QuantityHints::default(),
    }
  }

  pub fn with_hints(mut self, hints: QuantityHints) -> Self {
    self.hints = hints;
    self
  }
}

#[derive(Default)]
pub struct PipelineBuilder {
  detector: Option<Arc<dyn Detect>>,
  catalog: Option<CatalogHandle>,
  config: PipelineConfig,
}

impl PipelineBuilder {
  pub fn detector(mut self, detector: Arc<dyn Detect>) -> Self {
    self.detector = Some(detector);
    self
  }

  pub fn catalog(mut self, catalog: CatalogHandle) -> Self {
    self.catalog = Some(catalog);
    self
  }

  pub fn config(mut self, config: &PipelineConfig) -> Self {
    self.config = config.clone();
    self
  }

  pub fn build(self) -> Result<Pipeline, StartupError> {
    let config = self.config.validate()?;
    let detector = self
      .detector
      .ok_or_else(|| StartupError::ModelUnavailable("未提供检测器".into()))?;
    let catalog = self.catalog.ok_or_else(|| CatalogError::Unavailable {
      origin: "pipeline".to_string(),
      reason: "未提供营养库".to_string(),
    })?;
    let aggregator = Aggregator::new(config.default_quantity).map_err(|_| {
      StartupError::InvalidConfig(crate::config::ConfigError::InvalidQuantity(config.default_quantity))
    })?;

    info!("流水线就绪: {:?}", config);
    Ok(Pipeline {
      detector,
      catalog,
      detection_policy: config.detection_policy(),
      reconciler: Reconciler::new(config.reconcile_policy()),
      aggregator,
      detection_timeout: config.detection_timeout(),
      slots: DetectionSlots::new(config.max_concurrent_detections),
    })
  }
}

/// 顺序执行检测、对齐、汇总
///
/// 模型与营养库作为只读句柄在构造时注入，多个请求可并发调用 `run`。
pub struct Pipeline {
  detector: Arc<dyn Detect>,
  catalog: CatalogHandle,
  detection_policy: DetectionPolicy,
  reconciler: Reconciler,
  aggregator: Aggregator,
  detection_timeout: Option<Duration>,
  slots: Arc<DetectionSlots>,
}

impl Pipeline {
  pub fn builder() -> PipelineBuilder {
    PipelineBuilder::default()
  }

  pub fn catalog(&self) -> &CatalogHandle {
    &self.catalog
  }

  pub fn detection_policy(&self) -> &DetectionPolicy {
    &self.detection_policy
  }

  /// 仍在运行的检测线程数
  pub fn detections_in_flight(&self) -> usize {
    self.slots.in_flight.load(Ordering::SeqCst)
  }

  pub fn run(
    &self,
    image: &[u8],
    user_id: &str,
    timestamp: DateTime<Utc>,
  ) -> Result<IntakeRecord, PipelineError> {
    self.run_with(IntakeRequest::new(image, user_id, timestamp), &CancelFlag::new())
  }

  pub fn run_with(
    &self,
    request: IntakeRequest,
    cancel: &CancelFlag,
  ) -> Result<IntakeRecord, PipelineError> {
    let started = Instant::now();
    debug!("开始处理用户 {} 的提交", request.user_id);

    let detected = self
      .detect(Arc::clone(&request.image), cancel)
      .map_err(PipelineError::at(Stage::Detection))
      .inspect_err(|e| warn!("{}", e))?;
    if detected.items.is_empty() {
      info!("没有检测到食物，返回空记录");
    }

    let catalog = self
      .catalog
      .snapshot()
      .map_err(|e| StageError::from(ReconcileError::from(e)))
      .map_err(PipelineError::at(Stage::Reconciliation))
      .inspect_err(|e| error!("{}", e))?;
    let items = self.reconciler.reconcile(&detected.items, &catalog);

    let record = self
      .aggregator
      .build_record(request.user_id, request.timestamp, items, &request.hints)
      .map_err(StageError::from)
      .map_err(PipelineError::at(Stage::Aggregation))
      .inspect_err(|e| warn!("{}", e))?;

    info!(
      "提交 {} 处理完成: {} 项 ({} 项被接受), 耗时 {:.2?}",
      record.submission_id,
      record.items.len(),
      record.accepted_count(),
      started.elapsed()
    );
    Ok(record)
  }

  /// 在工作线程上推理，等待期间轮询取消标志
  ///
  /// 超时或取消时直接返回，工作线程被放弃；它只读共享模型，结果随通道一起丢弃。
  /// 被放弃的线程在推理结束前继续占用名额，名额用尽时新请求排队等待，
  /// 排队时间同样计入超时。
  fn detect(&self, image: Arc<[u8]>, cancel: &CancelFlag) -> Result<DetectResult, StageError> {
    let started = Instant::now();

    let slot = loop {
      if cancel.is_cancelled() {
        return Err(StageError::Cancelled);
      }
      if let Some(slot) = self.slots.try_acquire() {
        break slot;
      }
      debug!("检测名额已满 ({}), 等待", self.slots.limit);
      thread::sleep(self.next_wait(started)?);
    };

    let (tx, rx) = mpsc::channel();
    let detector = Arc::clone(&self.detector);
    let policy = self.detection_policy;
    thread::Builder::new()
      .name("yingyang-detect".to_string())
      .spawn(move || {
        let _slot = slot;
        let _ = tx.send(detector.detect(&image, &policy));
      })
      .map_err(|e| StageError::Worker(e.to_string()))?;

    loop {
      if cancel.is_cancelled() {
        warn!("检测被取消");
        return Err(StageError::Cancelled);
      }

      match rx.recv_timeout(self.next_wait(started)?) {
        Ok(result) => return Ok(result?),
        Err(RecvTimeoutError::Timeout) => continue,
        Err(RecvTimeoutError::Disconnected) => {
          return Err(StageError::Worker("检测线程意外退出".to_string()));
        }
      }
    }
  }

  /// 下一次等待的时长；超过截止时间时返回超时
  fn next_wait(&self, started: Instant) -> Result<Duration, StageError> {
    match self.detection_timeout {
      Some(timeout) => {
        let elapsed = started.elapsed();
        if elapsed >= timeout {
          warn!("检测超时: {:?}", timeout);
          return Err(StageError::Timeout(timeout));
        }
        Ok((timeout - elapsed).min(CANCEL_POLL_INTERVAL))
      }
      None => Ok(CANCEL_POLL_INTERVAL),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::catalog::tests::fruit_catalog;
  use crate::detector::{BoundingBox, Detection};
  use crate::frame::FrameError;
  use crate::intake::tests::noon;

  struct Fixed(Vec<Detection>);

  impl Detect for Fixed {
    fn detect(&self, _image: &[u8], policy: &DetectionPolicy) -> Result<DetectResult, InferenceError> {
      Ok(DetectResult {
        items: policy.apply(self.0.clone()),
        image_width: 64,
        image_height: 64,
        elapsed: Duration::ZERO,
        candidates: self.0.len(),
      })
    }
  }

  struct Slow(Duration);

  impl Detect for Slow {
    fn detect(&self, _image: &[u8], policy: &DetectionPolicy) -> Result<DetectResult, InferenceError> {
      thread::sleep(self.0);
      Fixed(Vec::new()).detect(&[], policy)
    }
  }

  struct Undecodable;

  impl Detect for Undecodable {
    fn detect(&self, _image: &[u8], _policy: &DetectionPolicy) -> Result<DetectResult, InferenceError> {
      Err(InferenceError::Decode(FrameError::Empty))
    }
  }

  struct Panicking;

  impl Detect for Panicking {
    fn detect(&self, _image: &[u8], _policy: &DetectionPolicy) -> Result<DetectResult, InferenceError> {
      panic!("backend crashed")
    }
  }

  fn pipeline(detector: Arc<dyn Detect>, config: PipelineConfig) -> Pipeline {
    Pipeline::builder()
      .detector(detector)
      .catalog(CatalogHandle::new(fruit_catalog()))
      .config(&config)
      .build()
      .unwrap()
  }

  fn det(label: &str) -> Detection {
    det_at(label, 0.9, 0.0)
  }

  fn det_at(label: &str, confidence: f32, offset: f32) -> Detection {
    Detection::new(
      label,
      confidence,
      BoundingBox::from([offset, offset, offset + 10.0, offset + 10.0]),
    )
    .unwrap()
  }

  #[test]
  fn runs_all_stages() {
    let p = pipeline(
      Arc::new(Fixed(vec![det("apple"), det("banana")])),
      PipelineConfig::default(),
    );
    let record = p.run(b"img", "u1", noon(1)).unwrap();
    assert_eq!(record.user_id, "u1");
    assert_eq!(record.totals["calories"], 200.0);
  }

  #[test]
  fn configured_detection_policy_is_applied() {
    let detector = Arc::new(Fixed(vec![det_at("apple", 0.5, 0.0), det_at("banana", 0.95, 50.0)]));
    let strict = PipelineConfig {
      confidence_threshold: 0.9,
      ..Default::default()
    };
    let p = pipeline(detector.clone(), strict);
    assert_eq!(p.detection_policy().confidence_threshold, 0.9);
    let record = p.run(b"img", "u1", noon(1)).unwrap();
    assert_eq!(record.items.len(), 1);
    assert_eq!(record.items[0].detection.label(), "banana");
    assert_eq!(record.totals["calories"], 105.0);

    let record = pipeline(detector, PipelineConfig::default())
      .run(b"img", "u1", noon(1))
      .unwrap();
    assert_eq!(record.items.len(), 2);
  }

  #[test]
  fn configured_iou_threshold_is_applied() {
    // 两个 apple 框 IoU ≈ 0.68
    let detector = Arc::new(Fixed(vec![det_at("apple", 0.9, 0.0), det_at("apple", 0.8, 1.0)]));
    let record = pipeline(detector.clone(), PipelineConfig::default())
      .run(b"img", "u1", noon(1))
      .unwrap();
    assert_eq!(record.items.len(), 1);

    let loose = PipelineConfig {
      iou_threshold: 0.9,
      ..Default::default()
    };
    let record = pipeline(detector, loose).run(b"img", "u1", noon(1)).unwrap();
    assert_eq!(record.items.len(), 2);
  }

  #[test]
  fn quantity_hints_flow_through() {
    let p = pipeline(Arc::new(Fixed(vec![det("apple")])), PipelineConfig::default());
    let request =
      IntakeRequest::new(b"img".to_vec(), "u1", noon(1)).with_hints(QuantityHints::new().with(0, 3.0));
    let record = p.run_with(request, &CancelFlag::new()).unwrap();
    assert_eq!(record.totals["calories"], 285.0);
  }

  #[test]
  fn inference_failure_is_detection_stage() {
    let p = pipeline(Arc::new(Undecodable), PipelineConfig::default());
    let err = p.run(b"", "u1", noon(1)).unwrap_err();
    assert_eq!(err.stage, Stage::Detection);
    assert!(matches!(err.cause, StageError::Inference(_)));
  }

  #[test]
  fn aggregation_failure_is_aggregation_stage() {
    let p = pipeline(Arc::new(Fixed(vec![det("apple")])), PipelineConfig::default());
    let request =
      IntakeRequest::new(b"img".to_vec(), "u1", noon(1)).with_hints(QuantityHints::new().with(0, f64::INFINITY));
    let err = p.run_with(request, &CancelFlag::new()).unwrap_err();
    assert_eq!(err.stage, Stage::Aggregation);
  }

  #[test]
  fn slow_detection_times_out() {
    let config = PipelineConfig {
      detection_timeout_ms: 50,
      ..Default::default()
    };
    let p = pipeline(Arc::new(Slow(Duration::from_secs(2))), config);
    let started = Instant::now();
    let err = p.run(b"img", "u1", noon(1)).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(err.stage, Stage::Detection);
    assert!(matches!(err.cause, StageError::Timeout(_)));
  }

  #[test]
  fn cancel_stops_waiting() {
    let p = pipeline(Arc::new(Slow(Duration::from_secs(2))), PipelineConfig::default());
    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    thread::spawn(move || {
      thread::sleep(Duration::from_millis(50));
      trigger.cancel();
    });
    let err = p
      .run_with(IntakeRequest::new(b"img".to_vec(), "u1", noon(1)), &cancel)
      .unwrap_err();
    assert!(matches!(err.cause, StageError::Cancelled));
  }

  #[test]
  fn abandoned_workers_hold_detection_slots() {
    let config = PipelineConfig {
      detection_timeout_ms: 50,
      max_concurrent_detections: 1,
      ..Default::default()
    };
    let p = pipeline(Arc::new(Slow(Duration::from_millis(400))), config);

    let err = p.run(b"img", "u1", noon(1)).unwrap_err();
    assert!(matches!(err.cause, StageError::Timeout(_)));
    assert_eq!(p.detections_in_flight(), 1);

    // 名额仍被上一个线程占用，排队直到超时，不会再起新线程
    let err = p.run(b"img", "u1", noon(1)).unwrap_err();
    assert!(matches!(err.cause, StageError::Timeout(_)));
    assert_eq!(p.detections_in_flight(), 1);

    thread::sleep(Duration::from_millis(600));
    assert_eq!(p.detections_in_flight(), 0);
  }

  #[test]
  fn worker_panic_is_reported() {
    let p = pipeline(Arc::new(Panicking), PipelineConfig::default());
    let err = p.run(b"img", "u1", noon(1)).unwrap_err();
    assert!(matches!(err.cause, StageError::Worker(_)));
  }

  #[test]
  fn builder_requires_handles() {
    assert!(matches!(
      Pipeline::builder()
        .catalog(CatalogHandle::new(fruit_catalog()))
        .build(),
      Err(StartupError::ModelUnavailable(_))
    ));
    assert!(matches!(
      Pipeline::builder()
        .detector(Arc::new(Fixed(Vec::new())))
        .build(),
      Err(StartupError::CatalogUnavailable(_))
    ));
    let bad = PipelineConfig {
      iou_threshold: 2.0,
      ..Default::default()
    };
    assert!(matches!(
      Pipeline::builder()
        .detector(Arc::new(Fixed(Vec::new())))
        .catalog(CatalogHandle::new(fruit_catalog()))
        .config(&bad)
        .build(),
      Err(StartupError::InvalidConfig(_))
    ));
  }
}
