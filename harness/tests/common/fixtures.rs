use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// A scratch directory holding bundle executables, a data tree, a results
/// directory, and a runner config pointing at all of them.
pub struct BundleFarm {
    pub dir: TempDir,
    pub bundles: PathBuf,
    pub out_dir: PathBuf,
    pub data_dir: PathBuf,
    pub config: PathBuf,
}

impl BundleFarm {
    pub fn new() -> Self {
        crate::test_log!("FIXTURE: Creating bundle farm");

        let dir = TempDir::new().expect("Failed to create temp dir");
        let bundles = dir.path().join("bundles");
        let out_dir = dir.path().join("results");
        let data_dir = dir.path().join("data");
        let config = dir.path().join("config.toml");
        fs::create_dir_all(&bundles).expect("Failed to create bundles dir");
        fs::create_dir_all(data_dir.join("example")).expect("Failed to create data dir");
        fs::write(data_dir.join("example").join("greeting.txt"), "hello\n")
            .expect("Failed to write data file");
        fs::write(
            &config,
            format!(
                "bundle_glob = {:?}\nout_dir = {:?}\ndata_dir = {:?}\n",
                format!("{}/*", bundles.display()),
                out_dir.display().to_string(),
                data_dir.display().to_string(),
            ),
        )
        .expect("Failed to write config");

        Self {
            dir,
            bundles,
            out_dir,
            data_dir,
            config,
        }
    }

    /// Install a bundle that serves the demo bundle's `suite`.
    pub fn add_demo_bundle(&self, name: &str, suite: &str) -> PathBuf {
        let body = format!(
            "exec {:?} --suite {suite} \"$@\"",
            env!("CARGO_BIN_EXE_harness-demo-bundle")
        );
        self.add_script(name, &body)
    }

    /// Install an executable shell script as a bundle.
    pub fn add_script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.bundles.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("Failed to write bundle");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("Failed to chmod bundle");
        path
    }

    /// Run the runner with this farm's config.
    pub fn harness(&self, args: &[&str]) -> Output {
        crate::test_log!("Running harness {:?}", args);
        Command::new(env!("CARGO_BIN_EXE_harness"))
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .env_remove("HARNESS_BUNDLE_GLOB")
            .env_remove("HARNESS_OUT_DIR")
            .env_remove("HARNESS_DATA_DIR")
            .output()
            .expect("Failed to run harness")
    }

    pub fn result_path(&self, test: &str) -> PathBuf {
        self.out_dir.join(test)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}
