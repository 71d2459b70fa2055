use crate::common::{BundleFarm, assert_contains, init_test_logging};
use harness_common::EntityInfo;

#[test]
fn test_harness_help_includes_description() {
    init_test_logging();
    crate::test_log!("TEST START: test_harness_help_includes_description");

    let output = std::process::Command::new(env!("CARGO_BIN_EXE_harness"))
        .arg("--help")
        .output()
        .expect("Failed to run harness --help");

    assert!(output.status.success(), "harness --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, "discovers bundles");
    crate::test_log!("TEST PASS: test_harness_help_includes_description");
}

#[test]
fn test_list_names_across_bundles() {
    init_test_logging();
    crate::test_log!("TEST START: test_list_names_across_bundles");

    let farm = BundleFarm::new();
    farm.add_demo_bundle("bundle0", "bundle0");
    farm.add_demo_bundle("bundle1", "bundle1");

    let output = farm.harness(&["list"]);
    assert!(output.status.success(), "list failed: {output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let names: Vec<&str> = stdout.lines().collect();
    assert_eq!(names, vec!["pkg.Test0", "pkg.Test1", "pkg.Test0"]);
    crate::test_log!("TEST PASS: test_list_names_across_bundles");
}

#[test]
fn test_list_by_attribute_expression() {
    init_test_logging();
    crate::test_log!("TEST START: test_list_by_attribute_expression");

    let farm = BundleFarm::new();
    farm.add_demo_bundle("example", "example");

    let output = farm.harness(&["list", "--json", "(\"group:example\" && !example_slow)"]);
    assert!(output.status.success(), "list failed: {output:?}");
    let tests: Vec<EntityInfo> =
        serde_json::from_slice(&output.stdout).expect("list --json output is not JSON");
    let names: Vec<&str> = tests.iter().map(|t| t.name.as_str()).collect();

    assert!(names.contains(&"example.Sleep.short"));
    assert!(!names.contains(&"example.Sleep.long"));
    let shared = tests
        .iter()
        .find(|t| t.name == "example.SharedFirst")
        .expect("SharedFirst listed");
    assert_eq!(shared.precondition.as_deref(), Some("example.loggedIn"));
    assert_eq!(shared.bundle, "example");
    crate::test_log!("TEST PASS: test_list_by_attribute_expression");
}

#[test]
fn test_list_with_name_glob() {
    init_test_logging();
    crate::test_log!("TEST START: test_list_with_name_glob");

    let farm = BundleFarm::new();
    farm.add_demo_bundle("bundle0", "bundle0");
    farm.add_demo_bundle("bundle1", "bundle1");

    let output = farm.harness(&["list", "*.Test1"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "pkg.Test1");
    crate::test_log!("TEST PASS: test_list_with_name_glob");
}

#[test]
fn test_list_without_bundles() {
    init_test_logging();
    crate::test_log!("TEST START: test_list_without_bundles");

    let farm = BundleFarm::new();
    let output = farm.harness(&["list"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());
    assert_contains(&String::from_utf8_lossy(&output.stderr), "no bundles matched");
    crate::test_log!("TEST PASS: test_list_without_bundles");
}

#[test]
fn test_bad_arguments_exit_code() {
    init_test_logging();
    crate::test_log!("TEST START: test_bad_arguments_exit_code");

    let farm = BundleFarm::new();
    let output = farm.harness(&["run", "--exit-timeout", "whenever"]);
    assert_eq!(output.status.code(), Some(1));
    crate::test_log!("TEST PASS: test_bad_arguments_exit_code");
}
