// 该文件是 Yingyang （营养） 项目的一部分。
// src/bin/intake_continuous.rs - 批量照片的营养摄入估计与每日汇总
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
  intake::IntakeLedger,
  model::YoloOnnxBuilder,
  output::OutputWrapper,
  pipeline::Pipeline,
  task::{ContinuousTask, Task},
};

/// Yingyang 批量处理参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测模型
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 营养库
  #[arg(long, value_name = "CATALOG")]
  pub catalog: Url,
  /// 输入来源，例如 folder:///photos
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径，例如 folder:///records?record
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 用户编号
  #[arg(long, value_name = "USER", default_value = "anonymous")]
  pub user: String,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,

  #[command(flatten)]
  pub config: ConfigArgs,
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
  let ledger = Arc::new(IntakeLedger::new());

  let report = ContinuousTask::new(args.user.clone())
    .with_frame_number(args.frame_number)
    .with_ledger(Arc::clone(&ledger))
    .with_ctrl_c()?
    .run_task(input, &pipeline, output)?;

  for summary in ledger.summaries_for(&args.user)? {
    println!("{}", serde_json::to_string_pretty(&summary)?);
  }
  info!("成功 {} 张, 失败 {} 张", report.processed, report.failed);

  Ok(())
}
