//! Human-readable rendering of a control stream, used by manual runs.

use crate::control::ControlMessage;
use crate::protocol::RunTestsResponse;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

const TIME_FORMAT: &str = "%H:%M:%S%.3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    Skip,
}

impl Verdict {
    fn label(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Skip => "SKIP",
        }
    }
}

#[derive(Debug)]
struct Running {
    started: DateTime<Utc>,
    errors: usize,
}

/// Turns control messages into log lines and remembers per-test outcomes.
#[derive(Debug, Default)]
pub struct HumanRenderer {
    running: HashMap<String, Running>,
    results: Vec<(String, Verdict, Vec<String>)>,
}

fn stamp(time: &DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

impl HumanRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines to print for `msg`.
    pub fn render(&mut self, msg: &ControlMessage) -> Vec<String> {
        let resp = match RunTestsResponse::try_from(msg.clone()) {
            Ok(resp) => resp,
            Err(framing) => return self.render_framing(&framing),
        };
        match resp {
            RunTestsResponse::RunLog { time, text } => vec![format!("{} {text}", stamp(&time))],
            RunTestsResponse::EntityStart { time, entity, .. } => {
                self.running.insert(
                    entity.name.clone(),
                    Running {
                        started: time,
                        errors: 0,
                    },
                );
                vec![format!("{} Started test {}", stamp(&time), entity.name)]
            }
            RunTestsResponse::EntityLog { time, text, .. } => {
                vec![format!("{} {text}", stamp(&time))]
            }
            RunTestsResponse::EntityError {
                time,
                entity_name,
                error,
            } => {
                if let Some(r) = self.running.get_mut(&entity_name) {
                    r.errors += 1;
                }
                let mut lines = vec![format!(
                    "{} Error at {}:{}: {}",
                    stamp(&time),
                    error.file,
                    error.line,
                    error.reason
                )];
                if !error.stack.is_empty() {
                    lines.extend(error.stack.lines().map(|l| format!("    {l}")));
                }
                lines
            }
            RunTestsResponse::EntityEnd {
                time,
                entity_name,
                skip_reasons,
            } => {
                let running = self.running.remove(&entity_name);
                let errors = running.as_ref().map(|r| r.errors).unwrap_or(0);
                let elapsed = running
                    .map(|r| (time - r.started).to_std().unwrap_or_default())
                    .unwrap_or_default();
                let (verdict, line) = if !skip_reasons.is_empty() {
                    (
                        Verdict::Skip,
                        format!(
                            "{} Skipped test {}: {}",
                            stamp(&time),
                            entity_name,
                            skip_reasons.join("; ")
                        ),
                    )
                } else if errors > 0 {
                    (
                        Verdict::Fail,
                        format!(
                            "{} Completed test {} in {:.1?} with {errors} error(s)",
                            stamp(&time),
                            entity_name,
                            elapsed
                        ),
                    )
                } else {
                    (
                        Verdict::Pass,
                        format!("{} Completed test {} in {:.1?}", stamp(&time), entity_name, elapsed),
                    )
                };
                self.results.push((entity_name, verdict, skip_reasons));
                vec![line]
            }
        }
    }

    fn render_framing(&mut self, msg: &ControlMessage) -> Vec<String> {
        match msg {
            ControlMessage::RunStart { time, num_tests, .. } => {
                vec![format!("{} Running {num_tests} test(s)", stamp(time))]
            }
            ControlMessage::RunEnd { time, out_dir } => {
                vec![format!("{} Results saved to {}", stamp(time), out_dir.display())]
            }
            ControlMessage::RunError { time, status, reason } => {
                vec![format!("{} Run failed ({status}): {reason}", stamp(time))]
            }
            _ => Vec::new(),
        }
    }

    /// Names of tests that reported at least one error.
    pub fn failed_tests(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, v, _)| *v == Verdict::Fail)
            .map(|(name, _, _)| name.as_str())
            .collect()
    }

    pub fn results(&self) -> impl Iterator<Item = (&str, Verdict)> {
        self.results.iter().map(|(name, v, _)| (name.as_str(), *v))
    }

    /// Per-test verdict table followed by the failed-test list.
    pub fn summary(&self) -> Vec<String> {
        let width = self.results.iter().map(|(n, _, _)| n.len()).max().unwrap_or(0);
        let mut lines = vec!["-".repeat(width + 8)];
        for (name, verdict, reasons) in &self.results {
            let mut line = format!("{name:<width$}  [ {} ]", verdict.label());
            if !reasons.is_empty() {
                line.push_str(&format!(" {}", reasons.join("; ")));
            }
            lines.push(line);
        }
        lines.push("-".repeat(width + 8));
        let failed = self.failed_tests();
        if failed.is_empty() {
            lines.push(format!("{} test(s) run, none failed", self.results.len()));
        } else {
            lines.push(format!("{} of {} test(s) failed:", failed.len(), self.results.len()));
            lines.extend(failed.iter().map(|n| format!("  {n}")));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityInfo, ErrorRecord};

    fn feed(r: &mut HumanRenderer, msgs: Vec<ControlMessage>) -> Vec<String> {
        msgs.iter().flat_map(|m| r.render(m)).collect()
    }

    fn run_of(name: &str, error: bool, skip: bool) -> Vec<ControlMessage> {
        let now = Utc::now();
        let mut msgs = vec![ControlMessage::EntityStart {
            time: now,
            info: EntityInfo {
                name: name.to_string(),
                ..EntityInfo::default()
            },
            out_dir: None,
        }];
        if error {
            msgs.push(ControlMessage::EntityError {
                time: now,
                name: name.to_string(),
                error: ErrorRecord {
                    reason: "boom".to_string(),
                    file: "t.rs".to_string(),
                    line: 7,
                    stack: String::new(),
                },
            });
        }
        msgs.push(ControlMessage::EntityEnd {
            time: now,
            name: name.to_string(),
            skip_reasons: if skip {
                vec!["missing SoftwareDeps: arc".to_string()]
            } else {
                vec![]
            },
        });
        msgs
    }

    #[test]
    fn test_verdicts_tracked() {
        let mut r = HumanRenderer::new();
        let mut msgs = run_of("ui.Pass", false, false);
        msgs.extend(run_of("ui.Fail", true, false));
        msgs.extend(run_of("ui.Skip", false, true));
        let lines = feed(&mut r, msgs);

        assert!(lines.iter().any(|l| l.ends_with("Error at t.rs:7: boom")));
        assert!(lines.iter().any(|l| l.contains("Skipped test ui.Skip: missing SoftwareDeps: arc")));
        assert_eq!(r.failed_tests(), vec!["ui.Fail"]);
        let verdicts: Vec<_> = r.results().collect();
        assert_eq!(
            verdicts,
            vec![
                ("ui.Pass", Verdict::Pass),
                ("ui.Fail", Verdict::Fail),
                ("ui.Skip", Verdict::Skip)
            ]
        );
    }

    #[test]
    fn test_summary_lists_failures() {
        let mut r = HumanRenderer::new();
        feed(&mut r, run_of("ui.Fail", true, false));
        let summary = r.summary();
        assert!(summary.iter().any(|l| l.contains("ui.Fail") && l.contains("[ FAIL ]")));
        assert!(summary.iter().any(|l| l == "1 of 1 test(s) failed:"));
    }

    #[test]
    fn test_framing_lines() {
        let mut r = HumanRenderer::new();
        let lines = r.render(&ControlMessage::RunStart {
            time: Utc::now(),
            test_names: vec!["a.B".to_string()],
            num_tests: 1,
        });
        assert!(lines[0].ends_with("Running 1 test(s)"));
    }
}
