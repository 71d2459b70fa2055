//! Bundle side of the runner/bundle protocol.
//!
//! A bundle executable builds a [`Registry`] and hands it to
//! [`run_bundle_main`], which reads one [`BundleRequest`] from stdin and
//! answers on stdout. Diagnostics go to stderr through `tracing`.

use crate::logging::{LogConfig, init_logging};
use crate::protocol::{
    BundleRequest, ListEntitiesRequest, ListEntitiesResponse, ProtocolError, RunTestsRequest,
    RunTestsResponse, parse_json_line, write_json_line,
};
use crate::registry::{Registry, RegistryError};
use crate::test_def::TestInstance;
use crate::testing::{
    Context, HookFn, Output, OutputSink, PreconditionSlot, RunConfig, run_test, same_precondition,
};
use crate::types::ExitStatus;
use chrono::Utc;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Writer shared between the bundle loop and per-test sinks.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to read request: {0}")]
    Request(#[source] ProtocolError),

    #[error(transparent)]
    Select(#[from] RegistryError),

    #[error("failed to write response: {0}")]
    Write(#[source] ProtocolError),
}

impl ServeError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            ServeError::Request(_) | ServeError::Select(_) => ExitStatus::BadArgs,
            ServeError::Write(_) => ExitStatus::BundleFailed,
        }
    }
}

/// Hooks a bundle runs around every test.
#[derive(Clone, Default)]
pub struct BundleConfig {
    pub pre_test_hook: Option<HookFn>,
    pub post_test_hook: Option<HookFn>,
}

/// Entry point for bundle executables.
pub fn run_bundle_main(registry: Registry) -> ExitCode {
    run_bundle_main_with(registry, BundleConfig::default())
}

pub fn run_bundle_main_with(registry: Registry, cfg: BundleConfig) -> ExitCode {
    let _guards = match init_logging(&LogConfig::from_env("warn")) {
        Ok(guards) => Some(guards),
        Err(err) => {
            eprintln!("Failed to initialize logging: {err}");
            None
        }
    };

    let output: SharedWriter = Arc::new(Mutex::new(Box::new(std::io::stdout())));
    match serve(&registry, &cfg, std::io::stdin().lock(), output) {
        Ok(()) => ExitStatus::Success.into(),
        Err(err) => {
            error!(bundle = registry.bundle(), "{err}");
            eprintln!("{}: {err}", registry.bundle());
            err.exit_status().into()
        }
    }
}

/// Answer one request read from `input`.
pub fn serve(
    registry: &Registry,
    cfg: &BundleConfig,
    mut input: impl Read,
    output: SharedWriter,
) -> Result<(), ServeError> {
    let mut raw = String::new();
    input
        .read_to_string(&mut raw)
        .map_err(|e| ServeError::Request(e.into()))?;
    let request: BundleRequest = parse_json_line(&raw).map_err(ServeError::Request)?;
    debug!(bundle = registry.bundle(), ?request, "Received request");

    match request {
        BundleRequest::List(req) => {
            let resp = list_entities(registry, &req)?;
            let mut w = lock(&output);
            write_json_line(&mut *w, &resp).map_err(ServeError::Write)
        }
        BundleRequest::Run(req) => run_tests(registry, cfg, &req, &output),
    }
}

/// Order in which a bundle runs tests: grouped by precondition, then by name.
pub fn sort_for_run(tests: &mut [TestInstance]) {
    tests.sort_by(|a, b| {
        (a.precondition_name().unwrap_or(""), a.name.as_str())
            .cmp(&(b.precondition_name().unwrap_or(""), b.name.as_str()))
    });
}

pub fn list_entities(
    registry: &Registry,
    req: &ListEntitiesRequest,
) -> Result<ListEntitiesResponse, ServeError> {
    let mut tests = registry.select_tests(&req.patterns)?;
    sort_for_run(&mut tests);
    Ok(ListEntitiesResponse {
        entities: tests.iter().map(TestInstance::entity_info).collect(),
    })
}

fn lock(w: &SharedWriter) -> std::sync::MutexGuard<'_, Box<dyn Write + Send>> {
    w.lock().unwrap_or_else(|e| e.into_inner())
}

fn send(output: &SharedWriter, resp: &RunTestsResponse) -> Result<(), ServeError> {
    let mut w = lock(output);
    write_json_line(&mut *w, resp).map_err(ServeError::Write)
}

/// Sink for one test's output. Once closed, late records from an abandoned
/// stage are dropped so nothing lands after the test's end record.
struct EntitySink {
    output: SharedWriter,
    name: String,
    closed: AtomicBool,
}

impl EntitySink {
    fn new(output: SharedWriter, name: &str) -> Self {
        Self {
            output,
            name: name.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        let _w = lock(&self.output);
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl OutputSink for EntitySink {
    fn emit(&self, output: Output) {
        let mut w = lock(&self.output);
        if self.closed.load(Ordering::SeqCst) {
            debug!(test = %self.name, "Dropping output written after the test ended");
            return;
        }
        let resp = match output {
            Output::Log { time, text } => RunTestsResponse::EntityLog {
                time,
                entity_name: self.name.clone(),
                text,
            },
            Output::Error { time, error } => RunTestsResponse::EntityError {
                time,
                entity_name: self.name.clone(),
                error,
            },
        };
        if let Err(err) = write_json_line(&mut *w, &resp) {
            warn!(test = %self.name, "Failed to write test output: {err}");
        }
    }
}

fn skip_reasons(test: &TestInstance, req: &RunTestsRequest, available: &HashSet<String>) -> Vec<String> {
    if !req.check_deps {
        return Vec::new();
    }
    let missing = test.missing_software_deps(available);
    if missing.is_empty() {
        Vec::new()
    } else {
        vec![format!("missing SoftwareDeps: {}", missing.join(", "))]
    }
}

fn run_tests(
    registry: &Registry,
    cfg: &BundleConfig,
    req: &RunTestsRequest,
    output: &SharedWriter,
) -> Result<(), ServeError> {
    let mut tests = registry.select_tests(&req.patterns)?;
    sort_for_run(&mut tests);

    let available: HashSet<String> = req.available_software_features.iter().cloned().collect();
    let unavailable: HashSet<&String> = req.unavailable_software_features.iter().collect();
    if req.check_deps {
        let mut unknown: Vec<&str> = tests
            .iter()
            .flat_map(|t| t.software_deps.iter())
            .filter(|d| !available.contains(*d) && !unavailable.contains(d))
            .map(String::as_str)
            .collect();
        unknown.sort_unstable();
        unknown.dedup();
        if !unknown.is_empty() {
            send(
                output,
                &RunTestsResponse::RunLog {
                    time: Utc::now(),
                    text: format!("Unknown software features treated as missing: {}", unknown.join(", ")),
                },
            )?;
        }
    }

    let skips: Vec<Vec<String>> = tests.iter().map(|t| skip_reasons(t, req, &available)).collect();
    let slot = PreconditionSlot::new();
    let ctx = Context::background();
    info!(bundle = registry.bundle(), count = tests.len(), "Running tests");

    for (i, test) in tests.iter().enumerate() {
        let out_dir = req.out_dir.as_ref().map(|d| d.join(&test.name));
        let skipped = !skips[i].is_empty();

        send(
            output,
            &RunTestsResponse::EntityStart {
                time: Utc::now(),
                entity: test.entity_info(),
                out_dir: if skipped { None } else { out_dir.clone() },
            },
        )?;

        if skipped {
            send(
                output,
                &RunTestsResponse::EntityEnd {
                    time: Utc::now(),
                    entity_name: test.name.clone(),
                    skip_reasons: skips[i].clone(),
                },
            )?;
            continue;
        }

        let next_pre = tests[i + 1..]
            .iter()
            .zip(&skips[i + 1..])
            .find(|(_, s)| s.is_empty())
            .and_then(|(t, _)| t.pre.as_ref());
        let run_cfg = RunConfig {
            out_dir,
            data_dir: req
                .data_dir
                .as_ref()
                .map(|d| d.join(&test.pkg))
                .unwrap_or_else(PathBuf::new),
            pre_test_hook: cfg.pre_test_hook.clone(),
            post_test_hook: cfg.post_test_hook.clone(),
            close_precondition: test.pre.is_some()
                && !same_precondition(test.pre.as_ref(), next_pre),
            precondition: slot.clone(),
            ..RunConfig::default()
        };

        let test = match req.exit_timeout {
            Some(exit_timeout) => std::borrow::Cow::Owned(TestInstance {
                exit_timeout,
                ..test.clone()
            }),
            None => std::borrow::Cow::Borrowed(test),
        };
        let sink = Arc::new(EntitySink::new(output.clone(), &test.name));
        let finished = run_test(&ctx, &test, sink.clone(), &run_cfg);
        sink.close();
        if !finished {
            // The abandoned stage may still be using the precondition.
            warn!(test = %test.name, "Test did not return on timeout; its precondition will be prepared again");
            slot.clear();
        }

        send(
            output,
            &RunTestsResponse::EntityEnd {
                time: Utc::now(),
                entity_name: test.name.clone(),
                skip_reasons: Vec::new(),
            },
        )?;
    }
    Ok(())
}
