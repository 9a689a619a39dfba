// 该文件是 Yingyang （营养） 项目的一部分。
// tests/property_tests.rs - 性质测试
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

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use uuid::Uuid;

use yingyang::{
  catalog::{CatalogEntry, NutrientAmounts, NutrientCatalog, NutrientProfile, normalize},
  detector::{BoundingBox, Detection, filter_by_confidence, iou, non_max_suppression},
  intake::{Aggregator, DailyIntakeSummary, IntakeRecord, QuantityHints, fold, merge, sum_totals},
  reconcile::ReconciledItem,
};

const NUTRIENTS: [&str; 4] = ["calories", "protein_g", "fiber_g", "iron_mg"];

fn detection(label: &str, confidence: f32, bbox: [f32; 4]) -> Detection {
  Detection::new(label, confidence, BoundingBox::from(bbox)).unwrap()
}

fn profile(idx: usize) -> Arc<NutrientProfile> {
  // 每个档案只含部分营养素，验证缺失按 0 处理
  let nutrients: NutrientAmounts = NUTRIENTS
    .iter()
    .enumerate()
    .filter(|(n, _)| (idx + n) % 3 != 0)
    .map(|(n, key)| (key.to_string(), ((idx + 1) * (n + 2)) as f64))
    .collect();
  Arc::new(NutrientProfile {
    canonical_name: format!("food {}", idx),
    display_name: format!("Food {}", idx),
    category: None,
    aliases: BTreeSet::new(),
    nutrients,
  })
}

fn reconciled(idx: usize, accepted: bool) -> ReconciledItem {
  ReconciledItem {
    detection: detection(&format!("food {}", idx), 0.9, [0.0, 0.0, 1.0, 1.0]),
    profile: Some(profile(idx)),
    match_confidence: if accepted { 1.0 } else { 0.3 },
    accepted,
    quantity: 1.0,
  }
}

fn assert_close(a: &NutrientAmounts, b: &NutrientAmounts) {
  assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
  for (key, value) in a {
    assert!((value - b[key]).abs() <= 1e-9 * value.abs().max(1.0), "{}: {} vs {}", key, value, b[key]);
  }
}

fn record(user: &str, amounts: &[f64]) -> IntakeRecord {
  let totals: NutrientAmounts = NUTRIENTS
    .iter()
    .zip(amounts)
    .filter(|(_, amount)| **amount > 0.0)
    .map(|(key, amount)| (key.to_string(), *amount))
    .collect();
  IntakeRecord {
    submission_id: Uuid::new_v4(),
    user_id: user.to_string(),
    timestamp: Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap(),
    items: Vec::new(),
    totals,
  }
}

fn empty_for(record: &IntakeRecord) -> DailyIntakeSummary {
  DailyIntakeSummary::for_record(record)
}

fn item_strategy() -> impl Strategy<Value = Vec<(usize, f64, bool)>> {
  prop::collection::vec((0usize..6, 0u32..8, any::<bool>()), 0..12).prop_map(|items| {
    items
      .into_iter()
      .map(|(idx, halves, accepted)| (idx, f64::from(halves) * 0.5, accepted))
      .collect()
  })
}

fn amounts_strategy() -> impl Strategy<Value = Vec<f64>> {
  prop::collection::vec((0u32..2000).prop_map(f64::from), NUTRIENTS.len())
}

proptest! {
  #[test]
  fn confidence_filter_excludes_everything_below(
    confidences in prop::collection::vec(0.0f32..=1.0, 0..64),
    threshold in 0.0f32..=1.0,
  ) {
    let detections: Vec<Detection> = confidences
      .iter()
      .map(|c| detection("apple", *c, [0.0, 0.0, 1.0, 1.0]))
      .collect();
    let kept = filter_by_confidence(detections, threshold);

    prop_assert!(kept.iter().all(|d| d.confidence() >= threshold));
    prop_assert_eq!(kept.len(), confidences.iter().filter(|c| **c >= threshold).count());
  }

  #[test]
  fn overlapping_same_label_keeps_only_higher(
    x in 0.0f32..500.0,
    y in 0.0f32..500.0,
    w in 10.0f32..200.0,
    h in 10.0f32..200.0,
    shift in 0.0f32..0.1,
    low in 0.05f32..0.5,
    gap in 0.01f32..0.5,
  ) {
    let high = low + gap;
    let a = detection("rice", low, [x, y, x + w, y + h]);
    let b = detection("rice", high, [x + w * shift, y + h * shift, x + w * (1.0 + shift), y + h * (1.0 + shift)]);
    prop_assume!(iou(a.bbox(), b.bbox()) > 0.45);

    let kept = non_max_suppression(vec![a, b], 0.45);
    prop_assert_eq!(kept.len(), 1);
    prop_assert_eq!(kept[0].confidence(), high);
  }

  #[test]
  fn suppression_never_crosses_labels(
    confidences in prop::collection::vec(0.05f32..=1.0, 1..16),
  ) {
    let labels = ["rice", "egg", "tofu"];
    let detections: Vec<Detection> = confidences
      .iter()
      .enumerate()
      .map(|(i, c)| detection(labels[i % labels.len()], *c, [0.0, 0.0, 10.0, 10.0]))
      .collect();
    let kept = non_max_suppression(detections, 0.45);

    let distinct: BTreeSet<&str> = (0..confidences.len()).map(|i| labels[i % labels.len()]).collect();
    prop_assert_eq!(kept.len(), distinct.len());
    for pair in kept.windows(2) {
      prop_assert!(pair[0].confidence() >= pair[1].confidence());
    }
  }

  #[test]
  fn name_and_alias_resolve_to_same_profile(
    name in "[A-Za-z]{3,8}( [A-Za-z]{3,8})?",
    alias in "[a-z]{3,8}-[a-z]{3,8}",
    noise in "[ _!.]{0,3}",
  ) {
    let catalog = NutrientCatalog::from_entries(vec![CatalogEntry {
      name: name.clone(),
      aliases: vec![alias.clone()],
      category: None,
      nutrients: BTreeMap::from([("calories".to_string(), Some(1.0))]),
    }])
    .unwrap();

    let by_name = catalog.lookup(&normalize(&name));
    let by_alias = catalog.lookup(&normalize(&alias));
    prop_assert!(by_name.is_some());
    prop_assert_eq!(&by_name, &by_alias);

    let decorated = format!("{}{}{}", noise, name.to_uppercase(), noise);
    prop_assert_eq!(&catalog.lookup(&decorated), &by_name);
  }

  #[test]
  fn record_totals_are_scaled_sums_and_order_free(
    (items, shuffled) in item_strategy().prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle())),
  ) {
    let aggregator = Aggregator::default();
    let build = |rows: &[(usize, f64, bool)]| {
      let plate: Vec<ReconciledItem> = rows.iter().map(|(idx, _, accepted)| reconciled(*idx, *accepted)).collect();
      let hints: QuantityHints = rows.iter().enumerate().map(|(i, (_, q, _))| (i, *q)).collect();
      aggregator
        .build_record("u1", Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap(), plate, &hints)
        .unwrap()
    };

    let forward = build(&items);
    let permuted = build(&shuffled);

    let mut expected = NutrientAmounts::new();
    for (idx, quantity, accepted) in &items {
      if !accepted {
        continue;
      }
      for (key, amount) in &profile(*idx).nutrients {
        *expected.entry(key.clone()).or_insert(0.0) += amount * quantity;
      }
    }

    assert_close(&forward.totals, &expected);
    assert_close(&forward.totals, &permuted.totals);
    assert_close(&sum_totals(&forward.items), &forward.totals);
  }

  #[test]
  fn fold_is_commutative(a in amounts_strategy(), b in amounts_strategy()) {
    let r1 = record("u1", &a);
    let r2 = record("u1", &b);

    let ab = fold(fold(empty_for(&r1), &r1).unwrap(), &r2).unwrap();
    let ba = fold(fold(empty_for(&r1), &r2).unwrap(), &r1).unwrap();
    prop_assert_eq!(ab, ba);
  }

  #[test]
  fn fold_is_associative(a in amounts_strategy(), b in amounts_strategy(), c in amounts_strategy()) {
    let r1 = record("u1", &a);
    let r2 = record("u1", &b);
    let r3 = record("u1", &c);

    let sequential = fold(fold(fold(empty_for(&r1), &r1).unwrap(), &r2).unwrap(), &r3).unwrap();
    let right = fold(fold(empty_for(&r2), &r2).unwrap(), &r3).unwrap();
    let grouped = merge(fold(empty_for(&r1), &r1).unwrap(), &right).unwrap();
    prop_assert_eq!(&sequential, &grouped);

    prop_assert_eq!(sequential.record_count, 3);
    prop_assert!(sequential.totals.values().all(|v| *v >= 0.0));
  }
}
