use std::fs;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_cli_prepare_pair() {
    let dir = tempdir().unwrap();
    let train_path = dir.path().join("train.csv");
    let test_path = dir.path().join("test.csv");
    let guide_path = dir.path().join("grades.guide");
    let out_dir = dir.path().join("out");

    fs::write(
        &train_path,
        "grade,student,gpa\n4,1,3.0\n3,2,2.5\n2,3,2.0",
    )
    .unwrap();
    fs::write(&test_path, "grade,student,gpa\n3,2,2.8\n4,3,3.1").unwrap();
    fs::write(&guide_path, "t:grade;\ne:student;\nr:gpa;\n").unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_fmprep"))
        .args([
            "prepare",
            train_path.to_str().unwrap(),
            test_path.to_str().unwrap(),
            "--guide",
            guide_path.to_str().unwrap(),
            "--output-dir",
            out_dir.to_str().unwrap(),
        ])
        .status()
        .expect("failed to run fmprep");

    assert!(status.success());
    for name in ["train.libfm", "test.libfm", "feature_map.json", "state.json"] {
        let path = out_dir.join(name);
        assert!(path.exists(), "missing {name}");
        assert!(fs::metadata(&path).unwrap().len() > 0);
    }

    // Every libFM line is "target idx:val ...".
    let train_libfm = fs::read_to_string(out_dir.join("train.libfm")).unwrap();
    assert_eq!(train_libfm.lines().count(), 3);
    for line in train_libfm.lines() {
        let mut parts = line.split_whitespace();
        parts.next().unwrap().parse::<f64>().unwrap();
        for entry in parts {
            assert!(entry.contains(':'), "bad entry '{entry}'");
        }
    }
}

#[test]
fn test_cli_run_experiment() {
    let dir = tempdir().unwrap();
    let input_path = dir.path().join("grades.csv");
    let guide_path = dir.path().join("grades.guide");
    let config_path = dir.path().join("experiment.yaml");
    let out_dir = dir.path().join("out");

    fs::write(
        &input_path,
        "grade,term,student,gpa\n\
         4,1,1,3.0\n3,1,2,2.5\n\
         2,2,1,3.1\n4,2,2,2.0",
    )
    .unwrap();
    fs::write(&guide_path, "t:grade;\ni:term;\ne:student;\nr:gpa;\n").unwrap();

    let yaml = format!(
        r#"
name: smoke
input: "{input}"
guide: "{guide}"
output_dir: "{out}"
split:
  column: term
  train: lt
  test: eq
"#,
        input = input_path.to_str().unwrap(),
        guide = guide_path.to_str().unwrap(),
        out = out_dir.to_str().unwrap()
    );
    fs::write(&config_path, yaml).unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_fmprep"))
        .args(["--quiet", "run", config_path.to_str().unwrap()])
        .status()
        .expect("failed to run fmprep");

    assert!(status.success());

    // Term 1 has no history; only term 2 becomes a split.
    let split_dir = out_dir.join("split-2");
    assert!(split_dir.join("train.libfm").exists());
    assert!(split_dir.join("test.libfm").exists());
    assert!(split_dir.join("state.json").exists());
    assert!(out_dir.join("results.json").exists());
    assert!(out_dir.join("lineage.json").exists());

    // Step durations and split counts land next to the other run artifacts.
    let metrics = fs::read_to_string(out_dir.join("metrics.json")).unwrap();
    let metrics: serde_json::Value = serde_json::from_str(&metrics).unwrap();
    assert_eq!(metrics["splits_generated"], 1);
    assert_eq!(metrics["splits_skipped"], 1);
    assert!(metrics["step_durations_ms"].get("split-2").is_some());

    let results = fs::read_to_string(out_dir.join("results.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&results).unwrap();
    assert_eq!(parsed.as_array().unwrap().len(), 1);
    assert_eq!(parsed[0]["value"], 2.0);
}
