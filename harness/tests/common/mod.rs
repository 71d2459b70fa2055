pub mod assertions;
pub mod fixtures;
pub mod logging;

pub use assertions::{assert_contains, assert_path_exists, control_messages};
pub use fixtures::BundleFarm;
pub use logging::init_test_logging;
