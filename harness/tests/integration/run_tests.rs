use crate::common::{
    BundleFarm, assert_contains, assert_path_exists, control_messages, init_test_logging,
};
use harness_common::{ControlMessage, ExitStatus};
use std::os::unix::fs::PermissionsExt;

fn error_names(msgs: &[ControlMessage]) -> Vec<&str> {
    msgs.iter()
        .filter_map(|m| match m {
            ControlMessage::EntityError { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_framework_run_across_two_bundles() {
    init_test_logging();
    crate::test_log!("TEST START: test_framework_run_across_two_bundles");

    let farm = BundleFarm::new();
    farm.add_demo_bundle("bundle0", "bundle0");
    farm.add_demo_bundle("bundle1", "bundle1");

    let output = farm.harness(&["run"]);
    assert!(output.status.success(), "run failed: {output:?}");
    let msgs = control_messages(&output.stdout);

    match msgs.first() {
        Some(ControlMessage::RunStart { num_tests, .. }) => assert_eq!(*num_tests, 3),
        other => panic!("expected RunStart first, got {other:?}"),
    }
    match msgs.last() {
        Some(ControlMessage::RunEnd { out_dir, .. }) => assert_eq!(out_dir, &farm.out_dir),
        other => panic!("expected RunEnd last, got {other:?}"),
    }
    assert_eq!(error_names(&msgs), vec!["pkg.Test0"]);
    let ends = msgs
        .iter()
        .filter(|m| matches!(m, ControlMessage::EntityEnd { .. }))
        .count();
    assert_eq!(ends, 3);

    let mode = std::fs::metadata(&farm.out_dir).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
    assert_path_exists(&farm.result_path("pkg.Test1"));
    crate::test_log!("TEST PASS: test_framework_run_across_two_bundles");
}

#[test]
fn test_manual_run_reports_failures() {
    init_test_logging();
    crate::test_log!("TEST START: test_manual_run_reports_failures");

    let farm = BundleFarm::new();
    farm.add_demo_bundle("bundle0", "bundle0");
    farm.add_demo_bundle("bundle1", "bundle1");

    let output = farm.harness(&["run", "--manual"]);
    assert_eq!(output.status.code(), Some(ExitStatus::TestFailed.code()));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, "Running 3 test(s)");
    assert_contains(&stdout, "Test0 failed on purpose");
    assert_contains(&stdout, "1 of 3 test(s) failed:");
    crate::test_log!("TEST PASS: test_manual_run_reports_failures");
}

#[test]
fn test_no_bundles_exits_before_stream() {
    init_test_logging();
    crate::test_log!("TEST START: test_no_bundles_exits_before_stream");

    let farm = BundleFarm::new();
    let output = farm.harness(&["run"]);
    assert_eq!(output.status.code(), Some(ExitStatus::NoBundles.code()));
    assert!(output.stdout.is_empty(), "unexpected stdout: {output:?}");
    assert!(!output.stderr.is_empty());
    crate::test_log!("TEST PASS: test_no_bundles_exits_before_stream");
}

#[test]
fn test_no_matching_tests_depends_on_mode() {
    init_test_logging();
    crate::test_log!("TEST START: test_no_matching_tests_depends_on_mode");

    let farm = BundleFarm::new();
    farm.add_demo_bundle("bundle0", "bundle0");

    let manual = farm.harness(&["run", "--manual", "nothing.*"]);
    assert_eq!(manual.status.code(), Some(ExitStatus::NoTests.code()));

    let framework = farm.harness(&["run", "nothing.*"]);
    assert!(framework.status.success(), "framework run failed: {framework:?}");
    let msgs = control_messages(&framework.stdout);
    assert!(matches!(msgs.first(), Some(ControlMessage::RunStart { num_tests: 0, .. })));
    assert!(matches!(msgs.last(), Some(ControlMessage::RunEnd { .. })));
    assert!(!msgs.iter().any(|m| matches!(m, ControlMessage::RunError { .. })));
    crate::test_log!("TEST PASS: test_no_matching_tests_depends_on_mode");
}

#[test]
fn test_example_suite_behaviours() {
    init_test_logging();
    crate::test_log!("TEST START: test_example_suite_behaviours");

    let farm = BundleFarm::new();
    farm.add_demo_bundle("example", "example");

    let output = farm.harness(&["run", "--check-deps", "example.*"]);
    assert!(output.status.success(), "run failed: {output:?}");
    let msgs = control_messages(&output.stdout);

    let mut failed = error_names(&msgs);
    failed.sort_unstable();
    failed.dedup();
    assert_eq!(failed, vec!["example.Fatal", "example.Panic"]);

    let skipped: Vec<&str> = msgs
        .iter()
        .filter_map(|m| match m {
            ControlMessage::EntityEnd {
                name, skip_reasons, ..
            } if !skip_reasons.is_empty() => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec!["example.NeedsChrome"]);

    let logins = msgs
        .iter()
        .filter(|m| matches!(m, ControlMessage::EntityLog { text, .. } if text.starts_with("Logging in")))
        .count();
    assert_eq!(logins, 1, "shared precondition prepared more than once");

    let read_data = msgs.iter().any(|m| {
        matches!(m, ControlMessage::EntityLog { name, text, .. }
            if name == "example.Data" && text.contains("hello"))
    });
    assert!(read_data, "data file not read");
    assert!(farm.data_dir.join("example").join("greeting.txt").exists());
    assert_path_exists(&farm.result_path("example.Artifacts").join("result.txt"));
    crate::test_log!("TEST PASS: test_example_suite_behaviours");
}

#[test]
fn test_failing_bundle_ends_stream_with_run_error() {
    init_test_logging();
    crate::test_log!("TEST START: test_failing_bundle_ends_stream_with_run_error");

    let farm = BundleFarm::new();
    // Lists like bundle1 but dies when asked to run.
    let body = format!(
        "input=$(cat)\ncase \"$input\" in\n  *'\"type\":\"list\"'*) printf '%s\\n' \"$input\" | exec {:?} --suite bundle1 ;;\n  *) echo 'exploded mid-run' >&2; exit 9 ;;\nesac",
        env!("CARGO_BIN_EXE_harness-demo-bundle")
    );
    farm.add_script("flaky", &body);

    let output = farm.harness(&["run"]);
    assert_eq!(output.status.code(), Some(ExitStatus::BundleFailed.code()));
    let msgs = control_messages(&output.stdout);
    assert!(matches!(msgs.first(), Some(ControlMessage::RunStart { .. })));
    match msgs.last() {
        Some(ControlMessage::RunError { status, reason, .. }) => {
            assert_eq!(*status, ExitStatus::BundleFailed);
            assert_contains(reason, "exploded mid-run");
        }
        other => panic!("expected RunError last, got {other:?}"),
    }
    assert!(farm.path().join("bundles").join("flaky").exists());
    crate::test_log!("TEST PASS: test_failing_bundle_ends_stream_with_run_error");
}
