use failure_triage::{
    CiAction, FailureNature, FailureType, HistoryState, TestUnit, TriageConfig, TriageEngine,
    UnitReport,
};

fn units_json(run: u32) -> String {
    format!(
        r#"[
  {{
    "test_name": "checkout_applies_coupon",
    "framework": "junit",
    "status": "failed",
    "events": [
      {{
        "test_name": "checkout_applies_coupon",
        "event_type": "assertion",
        "timestamp": "2024-07-0{run}T10:00:00Z",
        "level": "error",
        "message": "org.opentest4j.AssertionFailedError: expected: <42.00> but was: <40.00>",
        "stack_trace": "at com.shop.CheckoutTest.appliesCoupon(CheckoutTest.java:{line})",
        "framework": "junit"
      }}
    ],
    "application_logs": ["WARN coupon SPRING24 resolved to 0 rules"]
  }},
  {{
    "test_name": "search_renders",
    "framework": "playwright",
    "status": "passed",
    "events": [
      {{
        "test_name": "search_renders",
        "timestamp": "2024-07-0{run}T10:00:05Z",
        "level": "info",
        "message": "ok",
        "framework": "playwright"
      }}
    ]
  }}
]"#,
        line = 30 + run
    )
}

fn parse_units(run: u32) -> Vec<TestUnit> {
    serde_json::from_str(&units_json(run)).unwrap()
}

fn checkout_analysis(reports: &[UnitReport]) -> &failure_triage::TestAnalysis {
    reports[0].analysis().unwrap()
}

#[tokio::test]
async fn test_history_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = TriageConfig::default();
    config.history.database_path = Some(dir.path().join("history.db").display().to_string());
    config.batch.concurrency = Some(2);

    let engine = TriageEngine::from_config(&config, None).unwrap();
    let mut last = None;
    for run in 1..=3 {
        last = Some(engine.run(parse_units(run)).await);
    }
    engine.shutdown().await;

    let report = last.unwrap();
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.passed, 1);
    let analysis = checkout_analysis(&report.reports);
    assert_eq!(analysis.verdict.failure_type, FailureType::ProductDefect);
    assert_eq!(analysis.verdict.matched_rule_id.as_deref(), Some("junit-assertion"));
    assert_eq!(analysis.flaky.nature, FailureNature::Deterministic);
    assert_eq!(analysis.decision.action, CiAction::Fail);
    assert_eq!(report.summary.overall_action, CiAction::Fail);

    let engine = TriageEngine::from_config(&config, None).unwrap();
    let report = engine.run(parse_units(4)).await;
    engine.shutdown().await;

    let analysis = checkout_analysis(&report.reports);
    assert!(matches!(
        analysis.history,
        HistoryState::Repeating { frequency: 4, .. }
    ));
    assert_eq!(analysis.flaky.consecutive_failures, 4);
}

#[tokio::test]
async fn test_report_serializes_for_consumers() {
    let engine = TriageEngine::from_config(&TriageConfig::default(), None).unwrap();
    let report = engine.run(parse_units(1)).await;
    engine.shutdown().await;

    let json: serde_json::Value = serde_json::to_value(&report).unwrap();
    assert_eq!(json["reports"][0]["outcome"], "ANALYZED");
    assert_eq!(json["reports"][0]["verdict"]["failure_type"], "PRODUCT_DEFECT");
    assert_eq!(json["reports"][1]["outcome"], "PASSED");
    assert_eq!(json["summary"]["total"], 2);
    assert_eq!(json["rules_version"], 1);
    assert!(json["reports"][0]["confidence"]["final"].as_f64().unwrap() <= 1.0);
}

#[tokio::test]
async fn test_missing_generic_pack_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("junit.yaml"),
        "framework: junit\nrules:\n  - id: a\n    match_any: [x]\n    failure_type: PRODUCT_DEFECT\n    base_confidence: 0.5\n",
    )
    .unwrap();
    let mut config = TriageConfig::default();
    config.rules.dir = Some(dir.path().to_path_buf());
    assert!(TriageEngine::from_config(&config, None).is_err());
}
