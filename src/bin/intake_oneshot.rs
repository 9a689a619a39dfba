// 该文件是 Yingyang （营养） 项目的一部分。
// src/bin/intake_oneshot.rs - 单张照片的营养摄入估计
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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use yingyang::{
  FromUrl,
  catalog::{CatalogHandle, CatalogSource},
  config::ConfigArgs,
  detector::FoodDetector,
  error::StartupError,
  input::InputWrapper,
  intake::{RecommendedIntakeTable, calculate_gaps, gaps::DEFAULT_ENERGY_KEY},
  model::YoloOnnxBuilder,
  output::OutputWrapper,
  pipeline::Pipeline,
  task::{OneShotTask, Task},
};

/// Yingyang 单张照片参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测模型，例如 onnx:///models/yolov8n.onnx?size=640
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 营养库，例如 json:///data/catalog.json
  #[arg(long, value_name = "CATALOG")]
  pub catalog: Url,
  /// 输入来源，例如 image:///photos/lunch.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径，例如 image:///tmp/lunch.png 或 stdout:
  #[arg(long, value_name = "OUTPUT", default_value = "stdout:")]
  pub output: Url,
  /// 用户编号
  #[arg(long, value_name = "USER", default_value = "anonymous")]
  pub user: String,

  #[command(flatten)]
  pub config: ConfigArgs,

  /// 推荐摄入量表（JSON），与 --age/--gender 一起输出缺口分析
  #[arg(long, value_name = "FILE", requires_all = ["age", "gender"])]
  pub recommended: Option<PathBuf>,
  #[arg(long, value_name = "AGE")]
  pub age: Option<u32>,
  #[arg(long, value_name = "GENDER")]
  pub gender: Option<String>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("营养库: {}", args.catalog);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let config = args.config.resolve().map_err(StartupError::from)?;
  let model = YoloOnnxBuilder::from_url(&args.model)
    .and_then(YoloOnnxBuilder::build)
    .map_err(StartupError::from)?;
  let catalog = CatalogSource::from_url(&args.catalog)
    .and_then(|source| CatalogHandle::load(&source))
    .map_err(StartupError::from)?;

  let pipeline = Pipeline::builder()
    .detector(Arc::new(FoodDetector::new(model)))
    .catalog(catalog)
    .config(&config)
    .build()?;

  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let record = OneShotTask::new(args.user).run_task(input, &pipeline, output)?;

  if let (Some(path), Some(age), Some(gender)) = (&args.recommended, args.age, &args.gender) {
    let table = RecommendedIntakeTable::from_json_file(path)?;
    let rows = table.for_profile(age, gender)?;
    let report = calculate_gaps(&rows, &record.totals, DEFAULT_ENERGY_KEY);
    println!("{}", serde_json::to_string_pretty(&report)?);
  }

  Ok(())
}
