//! Runner-side orchestration: find bundles, list their tests, run them, and
//! turn their streams into one control stream.

use crate::bundle_process::{BundleError, run_bundle};
use crate::discovery::discover_bundles;
use crate::error::RunnerError;
use crate::shutdown::Shutdown;
use chrono::Utc;
use harness_common::protocol::parse_json_line;
use harness_common::{
    BundleRequest, ControlMessage, ControlTranslator, EntityInfo, ListEntitiesRequest,
    ListEntitiesResponse, RunTestsRequest, RunTestsResponse, RunnerConfig,
};
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Mode of the top-level results directory.
const OUT_DIR_MODE: u32 = 0o755;

/// Talks to bundles. [`ProcessClient`] runs them as child processes.
pub trait BundleClient: Send + Sync + 'static {
    fn list_entities(
        &self,
        bundle: &Path,
        req: &ListEntitiesRequest,
    ) -> impl Future<Output = Result<Vec<EntityInfo>, BundleError>> + Send;

    /// Stream the bundle's run records into `tx` until the run ends.
    fn run_tests(
        &self,
        bundle: &Path,
        req: &RunTestsRequest,
        tx: mpsc::Sender<RunTestsResponse>,
    ) -> impl Future<Output = Result<(), BundleError>> + Send;
}

/// Runs each bundle executable once per request.
#[derive(Clone)]
pub struct ProcessClient {
    /// Extra arguments passed to every bundle.
    pub args: Vec<String>,
    shutdown: Shutdown,
}

impl ProcessClient {
    pub fn new(shutdown: Shutdown) -> Self {
        Self {
            args: Vec::new(),
            shutdown,
        }
    }
}

impl BundleClient for ProcessClient {
    async fn list_entities(
        &self,
        bundle: &Path,
        req: &ListEntitiesRequest,
    ) -> Result<Vec<EntityInfo>, BundleError> {
        let (tx, mut rx) = mpsc::channel::<String>(16);
        let request = BundleRequest::List(req.clone());
        let gather = async {
            let mut out = String::new();
            while let Some(line) = rx.recv().await {
                out.push_str(&line);
                out.push('\n');
            }
            Ok::<_, BundleError>(out)
        };
        let run = run_bundle(bundle, &self.args, &request, tx, &self.shutdown);
        let ((), raw) = tokio::try_join!(run, gather)?;
        let resp: ListEntitiesResponse =
            parse_json_line(&raw).map_err(|source| BundleError::Protocol {
                path: bundle.to_path_buf(),
                source,
            })?;
        Ok(resp.entities)
    }

    async fn run_tests(
        &self,
        bundle: &Path,
        req: &RunTestsRequest,
        tx: mpsc::Sender<RunTestsResponse>,
    ) -> Result<(), BundleError> {
        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
        let request = BundleRequest::Run(req.clone());
        let decode = async {
            while let Some(line) = line_rx.recv().await {
                if line.trim().is_empty() {
                    continue;
                }
                let resp = parse_json_line(&line).map_err(|source| BundleError::Protocol {
                    path: bundle.to_path_buf(),
                    source,
                })?;
                if tx.send(resp).await.is_err() {
                    break;
                }
            }
            Ok::<_, BundleError>(())
        };
        let run = run_bundle(bundle, &self.args, &request, line_tx, &self.shutdown);
        tokio::try_join!(run, decode)?;
        Ok(())
    }
}

/// Tests one bundle will run, in the bundle's listing order.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleTests {
    pub bundle: PathBuf,
    pub tests: Vec<EntityInfo>,
}

/// Everything a run needs besides the bundles themselves.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub bundle_glob: String,
    pub patterns: Vec<String>,
    pub out_dir: PathBuf,
    pub data_dir: PathBuf,
    pub check_deps: bool,
    pub available_software_features: Vec<String>,
    pub unavailable_software_features: Vec<String>,
    pub exit_timeout: Option<Duration>,
}

impl RunOptions {
    pub fn from_config(config: &RunnerConfig, patterns: Vec<String>) -> Self {
        Self {
            bundle_glob: config.bundle_glob.clone(),
            patterns,
            out_dir: config.out_dir.clone(),
            data_dir: config.data_dir.clone(),
            check_deps: config.check_test_deps,
            available_software_features: config.available_software_features.clone(),
            unavailable_software_features: config.unavailable_software_features.clone(),
            exit_timeout: config.exit_timeout,
        }
    }

    fn run_request(&self, tests: &[EntityInfo]) -> RunTestsRequest {
        RunTestsRequest {
            patterns: tests.iter().map(|t| t.name.clone()).collect(),
            out_dir: Some(self.out_dir.clone()),
            data_dir: Some(self.data_dir.clone()),
            check_deps: self.check_deps,
            available_software_features: self.available_software_features.clone(),
            unavailable_software_features: self.unavailable_software_features.clone(),
            exit_timeout: self.exit_timeout,
        }
    }
}

/// Discover bundles and list their matching tests.
pub async fn get_bundles_and_tests<C: BundleClient>(
    client: Arc<C>,
    bundle_glob: &str,
    req: &ListEntitiesRequest,
) -> Result<Vec<BundleTests>, RunnerError> {
    let bundles = discover_bundles(bundle_glob)?;
    if bundles.is_empty() {
        return Err(RunnerError::NoBundles(bundle_glob.to_string()));
    }
    collect_bundle_tests(client, bundles, req).await
}

/// List every bundle concurrently.
///
/// Results come back sorted by bundle path with bundles that matched nothing
/// dropped. The first failure is returned and the remaining listings are
/// abandoned.
pub async fn collect_bundle_tests<C: BundleClient>(
    client: Arc<C>,
    bundles: Vec<PathBuf>,
    req: &ListEntitiesRequest,
) -> Result<Vec<BundleTests>, RunnerError> {
    let mut set = JoinSet::new();
    for bundle in bundles {
        let client = client.clone();
        let req = req.clone();
        set.spawn(async move {
            let tests = client.list_entities(&bundle, &req).await?;
            Ok::<_, BundleError>(BundleTests { bundle, tests })
        });
    }

    let mut found = Vec::new();
    while let Some(joined) = set.join_next().await {
        let listed = joined??;
        if !listed.tests.is_empty() {
            found.push(listed);
        }
    }
    found.sort_by(|a, b| a.bundle.cmp(&b.bundle));
    Ok(found)
}

/// Run every matching test and write the control stream to `out`.
///
/// With `require_tests`, matching nothing is an error; otherwise an empty
/// run is reported as a started-and-ended run with zero tests. Once
/// `RunStart` is written, any failure is reported as a final `RunError`.
pub async fn run<C: BundleClient, W: AsyncWrite + Unpin + Send>(
    client: Arc<C>,
    opts: &RunOptions,
    out: &mut W,
    require_tests: bool,
) -> Result<(), RunnerError> {
    let list_req = ListEntitiesRequest {
        patterns: opts.patterns.clone(),
    };
    let bundles = get_bundles_and_tests(client.clone(), &opts.bundle_glob, &list_req).await?;
    let test_names: Vec<String> = bundles
        .iter()
        .flat_map(|b| b.tests.iter().map(|t| t.name.clone()))
        .collect();
    if test_names.is_empty() && require_tests {
        return Err(RunnerError::NoTests(opts.patterns.clone()));
    }

    prepare_out_dir(&opts.out_dir)?;
    info!(
        tests = test_names.len(),
        bundles = bundles.len(),
        out_dir = %opts.out_dir.display(),
        "Starting run"
    );
    write_control(
        out,
        &ControlMessage::RunStart {
            time: Utc::now(),
            num_tests: test_names.len(),
            test_names,
        },
    )
    .await?;

    for bt in &bundles {
        if let Err(err) = run_bundle_tests(client.as_ref(), bt, opts, out).await {
            let msg = ControlMessage::RunError {
                time: Utc::now(),
                status: err.exit_status(),
                reason: err.to_string(),
            };
            // The original error matters more than a failure to report it.
            let _ = write_control(out, &msg).await;
            return Err(err);
        }
    }

    write_control(
        out,
        &ControlMessage::RunEnd {
            time: Utc::now(),
            out_dir: opts.out_dir.clone(),
        },
    )
    .await
}

async fn run_bundle_tests<C: BundleClient, W: AsyncWrite + Unpin + Send>(
    client: &C,
    bt: &BundleTests,
    opts: &RunOptions,
    out: &mut W,
) -> Result<(), RunnerError> {
    debug!(bundle = %bt.bundle.display(), tests = bt.tests.len(), "Running bundle");
    let req = opts.run_request(&bt.tests);
    let (tx, mut rx) = mpsc::channel(64);

    let drive = async {
        client
            .run_tests(&bt.bundle, &req, tx)
            .await
            .map_err(RunnerError::from)
    };
    let relay = async {
        let mut translator = ControlTranslator::new();
        while let Some(resp) = rx.recv().await {
            let msg = translator.translate(resp).map_err(|source| {
                RunnerError::Bundle(BundleError::Protocol {
                    path: bt.bundle.clone(),
                    source,
                })
            })?;
            write_control(out, &msg).await?;
        }
        translator.finish().map_err(|source| {
            RunnerError::Bundle(BundleError::Protocol {
                path: bt.bundle.clone(),
                source,
            })
        })
    };
    tokio::try_join!(drive, relay)?;
    Ok(())
}

fn prepare_out_dir(dir: &Path) -> Result<(), RunnerError> {
    let io_err = |source: std::io::Error| RunnerError::Io {
        path: dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(OUT_DIR_MODE)).map_err(io_err)
}

/// Write one control message as a JSON line and flush.
pub async fn write_control<W: AsyncWrite + Unpin>(
    out: &mut W,
    msg: &ControlMessage,
) -> Result<(), RunnerError> {
    let mut line = serde_json::to_vec(msg)
        .map_err(|e| RunnerError::Output(std::io::Error::other(e)))?;
    line.push(b'\n');
    out.write_all(&line).await.map_err(RunnerError::Output)?;
    out.flush().await.map_err(RunnerError::Output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_common::ErrorRecord;
    use harness_common::protocol::read_json_lines;
    use std::collections::HashMap;
    use std::fs;

    #[derive(Default)]
    struct MockBundle {
        tests: Vec<&'static str>,
        list_delay_ms: u64,
        fail_list: bool,
        fail_run: bool,
        error_tests: Vec<&'static str>,
    }

    #[derive(Default)]
    struct MockClient {
        bundles: HashMap<PathBuf, MockBundle>,
    }

    fn entity(bundle: &Path, name: &str) -> EntityInfo {
        EntityInfo {
            name: name.to_string(),
            pkg: name.split('.').next().unwrap_or_default().to_string(),
            bundle: bundle.file_name().unwrap().to_string_lossy().into_owned(),
            timeout: Duration::from_secs(60),
            ..EntityInfo::default()
        }
    }

    fn exited(bundle: &Path) -> BundleError {
        BundleError::Exited {
            path: bundle.to_path_buf(),
            code: Some(1),
            stderr: "mock failure".to_string(),
        }
    }

    impl BundleClient for MockClient {
        async fn list_entities(
            &self,
            bundle: &Path,
            _req: &ListEntitiesRequest,
        ) -> Result<Vec<EntityInfo>, BundleError> {
            let mock = &self.bundles[bundle];
            tokio::time::sleep(Duration::from_millis(mock.list_delay_ms)).await;
            if mock.fail_list {
                return Err(exited(bundle));
            }
            Ok(mock.tests.iter().map(|t| entity(bundle, t)).collect())
        }

        async fn run_tests(
            &self,
            bundle: &Path,
            req: &RunTestsRequest,
            tx: mpsc::Sender<RunTestsResponse>,
        ) -> Result<(), BundleError> {
            let mock = &self.bundles[bundle];
            for name in &req.patterns {
                let now = Utc::now();
                let _ = tx
                    .send(RunTestsResponse::EntityStart {
                        time: now,
                        entity: entity(bundle, name),
                        out_dir: req.out_dir.as_ref().map(|d| d.join(name)),
                    })
                    .await;
                if mock.error_tests.contains(&name.as_str()) {
                    let _ = tx
                        .send(RunTestsResponse::EntityError {
                            time: now,
                            entity_name: name.clone(),
                            error: ErrorRecord {
                                reason: "broken".to_string(),
                                file: "mock.rs".to_string(),
                                line: 1,
                                stack: String::new(),
                            },
                        })
                        .await;
                }
                let _ = tx
                    .send(RunTestsResponse::EntityEnd {
                        time: now,
                        entity_name: name.clone(),
                        skip_reasons: vec![],
                    })
                    .await;
            }
            if mock.fail_run {
                return Err(exited(bundle));
            }
            Ok(())
        }
    }

    /// Lay out executable bundle files so discovery finds them.
    fn setup(bundles: Vec<(&str, MockBundle)>) -> (tempfile::TempDir, Arc<MockClient>) {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bundles");
        fs::create_dir(&bin).unwrap();
        let mut client = MockClient::default();
        for (name, mock) in bundles {
            let path = bin.join(name);
            fs::write(&path, "").unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            client.bundles.insert(path, mock);
        }
        (dir, Arc::new(client))
    }

    fn options(dir: &Path) -> RunOptions {
        RunOptions {
            bundle_glob: format!("{}/bundles/*", dir.display()),
            out_dir: dir.join("out"),
            data_dir: dir.join("data"),
            ..RunOptions::default()
        }
    }

    async fn run_to_messages(
        client: Arc<MockClient>,
        opts: &RunOptions,
        require_tests: bool,
    ) -> (Result<(), RunnerError>, Vec<ControlMessage>) {
        let mut out = Vec::new();
        let res = run(client, opts, &mut out, require_tests).await;
        let msgs = read_json_lines(out.as_slice()).unwrap();
        (res, msgs)
    }

    #[tokio::test]
    async fn test_listing_is_sorted_regardless_of_completion_order() {
        for _ in 0..50 {
            let names = ["a", "b", "c", "d", "e"];
            let mut bundles = Vec::new();
            for name in names {
                let empty = fastrand::u8(0..4) == 0;
                let tests = if empty {
                    vec![]
                } else {
                    vec!["pkg.Second", "pkg.First"]
                };
                bundles.push((
                    name,
                    MockBundle {
                        tests,
                        list_delay_ms: fastrand::u64(0..5),
                        ..MockBundle::default()
                    },
                ));
            }
            let expected_nonempty: Vec<PathBuf> = {
                let mut paths: Vec<_> = bundles
                    .iter()
                    .filter(|(_, m)| !m.tests.is_empty())
                    .map(|(n, _)| PathBuf::from(*n))
                    .collect();
                paths.sort();
                paths
            };
            let (dir, client) = setup(bundles);
            let opts = options(dir.path());

            let found =
                get_bundles_and_tests(client, &opts.bundle_glob, &ListEntitiesRequest::default())
                    .await
                    .unwrap();
            let got: Vec<PathBuf> = found
                .iter()
                .map(|b| PathBuf::from(b.bundle.file_name().unwrap()))
                .collect();
            assert_eq!(got, expected_nonempty);
            for b in &found {
                let order: Vec<&str> = b.tests.iter().map(|t| t.name.as_str()).collect();
                assert_eq!(order, vec!["pkg.Second", "pkg.First"]);
            }
        }
    }

    #[tokio::test]
    async fn test_first_listing_failure_wins_without_waiting() {
        let (dir, client) = setup(vec![
            (
                "fast_fail",
                MockBundle {
                    fail_list: true,
                    ..MockBundle::default()
                },
            ),
            (
                "slow",
                MockBundle {
                    tests: vec!["pkg.Slow"],
                    list_delay_ms: 30_000,
                    ..MockBundle::default()
                },
            ),
        ]);
        let opts = options(dir.path());
        let started = std::time::Instant::now();
        let err = get_bundles_and_tests(client, &opts.bundle_glob, &ListEntitiesRequest::default())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            RunnerError::Bundle(BundleError::Exited { path, .. }) => {
                assert!(path.ends_with("fast_fail"));
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn test_middle_bundle_failure_discards_sibling_listings() {
        for _ in 0..10 {
            let (dir, client) = setup(vec![
                (
                    "a",
                    MockBundle {
                        tests: vec!["pkg.A"],
                        list_delay_ms: fastrand::u64(0..20),
                        ..MockBundle::default()
                    },
                ),
                (
                    "b",
                    MockBundle {
                        tests: vec!["pkg.B"],
                        list_delay_ms: fastrand::u64(0..20),
                        fail_list: true,
                        ..MockBundle::default()
                    },
                ),
                (
                    "c",
                    MockBundle {
                        tests: vec!["pkg.C"],
                        list_delay_ms: fastrand::u64(0..20),
                        ..MockBundle::default()
                    },
                ),
            ]);
            let opts = options(dir.path());
            let res =
                get_bundles_and_tests(client, &opts.bundle_glob, &ListEntitiesRequest::default())
                    .await;
            match res {
                Err(RunnerError::Bundle(BundleError::Exited { path, .. })) => {
                    assert!(path.ends_with("b"), "wrong bundle blamed: {}", path.display());
                }
                other => panic!("expected b's failure alone, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_no_bundles() {
        let (dir, client) = setup(vec![]);
        let opts = options(dir.path());
        let (res, msgs) = run_to_messages(client, &opts, false).await;
        assert!(matches!(res, Err(RunnerError::NoBundles(_))));
        assert!(msgs.is_empty());
    }

    #[tokio::test]
    async fn test_full_run_stream() {
        let (dir, client) = setup(vec![
            (
                "bundle0",
                MockBundle {
                    tests: vec!["pkg.Test0", "pkg.Test1"],
                    error_tests: vec!["pkg.Test0"],
                    ..MockBundle::default()
                },
            ),
            (
                "bundle1",
                MockBundle {
                    tests: vec!["pkg.Test0"],
                    ..MockBundle::default()
                },
            ),
        ]);
        let opts = options(dir.path());
        let (res, msgs) = run_to_messages(client, &opts, true).await;
        res.unwrap();

        match &msgs[0] {
            ControlMessage::RunStart {
                num_tests,
                test_names,
                ..
            } => {
                assert_eq!(*num_tests, 3);
                assert_eq!(test_names, &["pkg.Test0", "pkg.Test1", "pkg.Test0"]);
            }
            other => panic!("expected RunStart, got {other:?}"),
        }
        assert!(matches!(msgs.last(), Some(ControlMessage::RunEnd { .. })));
        let errors = msgs
            .iter()
            .filter(|m| matches!(m, ControlMessage::EntityError { .. }))
            .count();
        assert_eq!(errors, 1);
        let ends = msgs
            .iter()
            .filter(|m| matches!(m, ControlMessage::EntityEnd { .. }))
            .count();
        assert_eq!(ends, 3);

        let mode = fs::metadata(&opts.out_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_bundle_failure_ends_with_run_error() {
        let (dir, client) = setup(vec![
            (
                "bundle0",
                MockBundle {
                    tests: vec!["pkg.A"],
                    fail_run: true,
                    ..MockBundle::default()
                },
            ),
            (
                "bundle1",
                MockBundle {
                    tests: vec!["pkg.B"],
                    ..MockBundle::default()
                },
            ),
        ]);
        let opts = options(dir.path());
        let (res, msgs) = run_to_messages(client, &opts, true).await;
        assert!(matches!(res, Err(RunnerError::Bundle(_))));
        match msgs.last() {
            Some(ControlMessage::RunError { status, .. }) => {
                assert_eq!(*status, harness_common::ExitStatus::BundleFailed);
            }
            other => panic!("expected RunError, got {other:?}"),
        }
        // bundle1 never ran.
        assert!(!msgs.iter().any(|m| matches!(
            m,
            ControlMessage::EntityStart { info, .. } if info.name == "pkg.B"
        )));
    }

    #[tokio::test]
    async fn test_no_tests_depends_on_mode() {
        let (dir, client) = setup(vec![("empty", MockBundle::default())]);
        let opts = options(dir.path());

        let (res, msgs) = run_to_messages(client.clone(), &opts, true).await;
        assert!(matches!(res, Err(RunnerError::NoTests(_))));
        assert!(msgs.is_empty());

        let (res, msgs) = run_to_messages(client, &opts, false).await;
        res.unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0], ControlMessage::RunStart { num_tests: 0, .. }));
        assert!(matches!(msgs[1], ControlMessage::RunEnd { .. }));
    }

    #[test]
    fn test_run_request_carries_options() {
        let opts = RunOptions {
            out_dir: PathBuf::from("/out"),
            data_dir: PathBuf::from("/data"),
            check_deps: true,
            available_software_features: vec!["chrome".into()],
            exit_timeout: Some(Duration::from_secs(5)),
            ..RunOptions::default()
        };
        let req = opts.run_request(&[entity(Path::new("/b/cros"), "ui.Login")]);
        assert_eq!(req.patterns, vec!["ui.Login"]);
        assert_eq!(req.out_dir.as_deref(), Some(Path::new("/out")));
        assert!(req.check_deps);
        assert_eq!(req.exit_timeout, Some(Duration::from_secs(5)));
    }
}
