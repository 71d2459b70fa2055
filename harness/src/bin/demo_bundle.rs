//! Demo bundle used by the runner's end-to-end tests and as a worked example
//! of writing a bundle.
//!
//! `--suite` picks which set of tests to register; the suite name is also
//! the bundle name.

use clap::{Parser, ValueEnum};
use harness_common::bundle::run_bundle_main;
use harness_common::{
    Context, Param, PreState, PreValue, Precondition, Registry, RegistryError, State, Test,
};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "harness-demo-bundle")]
#[command(author, version, about = "Demo test bundle")]
struct Cli {
    /// Test set to register
    #[arg(long, value_enum, default_value = "example")]
    suite: Suite,
}

#[derive(Clone, Copy, ValueEnum)]
enum Suite {
    Bundle0,
    Bundle1,
    Example,
}

impl Suite {
    fn bundle_name(self) -> &'static str {
        match self {
            Suite::Bundle0 => "bundle0",
            Suite::Bundle1 => "bundle1",
            Suite::Example => "example",
        }
    }
}

/// Pretend login shared by consecutive tests that declare it.
struct LoggedIn;

impl Precondition for LoggedIn {
    fn name(&self) -> &str {
        "example.loggedIn"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn prepare(&self, _ctx: &Context, s: &PreState) -> Option<PreValue> {
        s.log(format!("Logging in for {}", s.test_name()));
        Some(Arc::new(String::from("session-token")))
    }

    fn close(&self, _ctx: &Context, s: &PreState) {
        s.log("Logging out");
    }
}

fn register(suite: Suite) -> Result<Registry, RegistryError> {
    let mut reg = Registry::new(suite.bundle_name());
    match suite {
        Suite::Bundle0 => {
            reg.add_test(
                Test::new("pkg", "Test0", |_, s| s.error("Test0 failed on purpose"))
                    .attr(["group:demo"]),
            )?;
            reg.add_test(
                Test::new("pkg", "Test1", |_, s| s.log("Test1 ran")).attr(["group:demo"]),
            )?;
        }
        Suite::Bundle1 => {
            reg.add_test(
                Test::new("pkg", "Test0", |_, s| s.log("bundle1 Test0 ran")).attr(["group:demo"]),
            )?;
        }
        Suite::Example => register_examples(&mut reg)?,
    }
    Ok(reg)
}

fn register_examples(reg: &mut Registry) -> Result<(), RegistryError> {
    let logged_in: Arc<dyn Precondition> = Arc::new(LoggedIn);

    reg.add_test(
        Test::new("example", "Pass", |_, s| s.log("Everything is fine"))
            .desc("Always passes")
            .contacts(["harness-dev@example.org"])
            .attr(["group:example", "example_smoke"]),
    )?;
    reg.add_test(
        Test::new("example", "Fatal", |_, s| {
            s.fatal("Giving up early");
        })
        .desc("Stops at the first problem")
        .attr(["group:example"]),
    )?;
    reg.add_test(
        Test::new("example", "Panic", |_, _| panic!("unexpected state"))
            .desc("Panics; reported as an error with its location")
            .attr(["group:example"]),
    )?;
    reg.add_test(
        Test::new("example", "Data", |_, s| {
            let path = s.data_path("greeting.txt");
            match std::fs::read_to_string(&path) {
                Ok(text) => s.log(format!("Read {:?}", text.trim())),
                Err(e) => s.error(format!("Failed to read {}: {e}", path.display())),
            }
        })
        .desc("Reads a declared data file")
        .attr(["group:example"])
        .data(["greeting.txt"]),
    )?;
    reg.add_test(
        Test::new("example", "Artifacts", |_, s| {
            let Some(dir) = s.out_dir() else {
                s.fatal("No output directory");
            };
            if let Err(e) = std::fs::write(dir.join("result.txt"), "ok\n") {
                s.error(format!("Failed to save result: {e}"));
            }
        })
        .desc("Writes a file into its output directory")
        .attr(["group:example"]),
    )?;
    for func in ["SharedFirst", "SharedSecond"] {
        reg.add_test(
            Test::new("example", func, |_, s| match s.pre_value::<String>() {
                Some(token) => s.log(format!("Using {token}")),
                None => s.error("Precondition value missing"),
            })
            .desc("Shares a login with its neighbour")
            .attr(["group:example"])
            .pre(logged_in.clone()),
        )?;
    }
    reg.add_test(
        Test::new("example", "Sleep", |ctx, s| {
            let want = s.param::<Duration>().copied().unwrap_or_default();
            if ctx.sleep(want).is_err() {
                s.error("Deadline hit while sleeping");
            }
        })
        .desc("Sleeps for a parameterized duration")
        .attr(["group:example"])
        .timeout(Duration::from_secs(10))
        .params([
            Param::new("short").value(Duration::from_millis(10)),
            Param::new("long")
                .value(Duration::from_millis(200))
                .extra_attr(["example_slow"]),
        ]),
    )?;
    reg.add_test(
        Test::new("example", "NeedsChrome", |_, s| s.log("Chrome is here"))
            .desc("Only runs where chrome is available")
            .attr(["group:example"])
            .software_deps(["chrome"]),
    )?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match register(cli.suite) {
        Ok(reg) => run_bundle_main(reg),
        Err(err) => {
            eprintln!("Invalid test registration: {err}");
            harness_common::ExitStatus::BadArgs.into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_suite_registers() {
        for suite in [Suite::Bundle0, Suite::Bundle1, Suite::Example] {
            let reg = register(suite).unwrap();
            assert!(!reg.is_empty());
            assert_eq!(reg.bundle(), suite.bundle_name());
        }
    }

    #[test]
    fn test_example_params_expand() {
        let reg = register(Suite::Example).unwrap();
        let names: Vec<String> = reg.all_tests().into_iter().map(|t| t.name).collect();
        assert!(names.contains(&"example.Sleep.short".to_string()));
        assert!(names.contains(&"example.Sleep.long".to_string()));
    }
}
