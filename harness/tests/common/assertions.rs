use harness_common::ControlMessage;
use std::path::Path;

pub fn assert_contains(haystack: &str, needle: &str) {
    assert!(
        haystack.contains(needle),
        "Expected to find '{needle}' in output, got: {haystack}"
    );
}

pub fn assert_path_exists(path: &Path) {
    assert!(path.exists(), "Expected path to exist: {}", path.display());
}

/// Parse the runner's stdout as a control-message stream.
pub fn control_messages(stdout: &[u8]) -> Vec<ControlMessage> {
    harness_common::protocol::read_json_lines(stdout).expect("stdout is not a control stream")
}
