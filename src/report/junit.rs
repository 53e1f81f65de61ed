//! JUnit XML reporter.
//!
//! Accumulates test outcomes as they arrive and writes one `<testsuites>`
//! document at [`Reporter::on_end`]. Failure messages are wrapped in CDATA
//! (not escaped text) so multi-line stack traces survive intact, and
//! captured stdout/stderr are attached as `<system-out>`/`<system-err>`
//! after stripping ANSI escapes and control codes CI XML parsers reject.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::info;

use crate::model::{TestError, TestId, TestResult, TestStatus};
use crate::report::{Reporter, RunSummary};

/// Static identity of a test, known once the plan is generated — JUnit
/// needs human-readable names that the wire protocol addresses by id alone.
/// `file` is the test file's discovered path, relative to the test root;
/// one `<testsuite>` is emitted per distinct `file` (§6).
#[derive(Debug, Clone)]
pub struct TestMeta {
    pub file: String,
    pub classname: String,
    pub name: String,
}

struct CaseRecord {
    meta: TestMeta,
    status: TestStatus,
    duration: Duration,
    error: Option<TestError>,
    stdout: String,
    stderr: String,
}

/// Writes a JUnit XML report at the configured path when the run ends.
pub struct JUnitReporter {
    output_path: PathBuf,
    meta: HashMap<TestId, TestMeta>,
    cases: Mutex<Vec<CaseRecord>>,
    live_output: Mutex<HashMap<TestId, (String, String)>>,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            meta: HashMap::new(),
            cases: Mutex::new(Vec::new()),
            live_output: Mutex::new(HashMap::new()),
        }
    }

    /// Supplies the `(classname, name)` pairs this reporter will need at
    /// `on_test_end` time. Call before the run starts.
    pub fn with_test_meta(mut self, meta: HashMap<TestId, TestMeta>) -> Self {
        self.meta = meta;
        self
    }
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_stdout(&self, test_id: Option<TestId>, text: &str) {
        if let Some(id) = test_id {
            self.live_output.lock().unwrap().entry(id).or_default().0.push_str(text);
        }
    }

    async fn on_stderr(&self, test_id: Option<TestId>, text: &str) {
        if let Some(id) = test_id {
            self.live_output.lock().unwrap().entry(id).or_default().1.push_str(text);
        }
    }

    async fn on_test_end(&self, test_id: TestId, result: &TestResult) {
        let meta = self
            .meta
            .get(&test_id)
            .cloned()
            .unwrap_or_else(|| TestMeta {
                file: "unknown".to_string(),
                classname: "unknown".to_string(),
                name: format!("test #{test_id}"),
            });
        let (stdout, stderr) = self
            .live_output
            .lock()
            .unwrap()
            .remove(&test_id)
            .unwrap_or_default();

        self.cases.lock().unwrap().push(CaseRecord {
            meta,
            status: result.status,
            duration: result.duration,
            error: result.error.clone(),
            stdout,
            stderr,
        });
    }

    async fn on_end(&self, _summary: &RunSummary) {
        let cases = self.cases.lock().unwrap();
        if let Some(parent) = self.output_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::error!(error = %e, "failed to create junit output directory");
                return;
            }
        }
        let xml = render_testsuite(&cases);
        if let Err(e) = std::fs::write(&self.output_path, xml) {
            tracing::error!(error = %e, "failed to write junit xml");
            return;
        }
        info!(path = %self.output_path.display(), "wrote junit xml");
    }
}

fn counts(cases: &[&CaseRecord]) -> (usize, usize, usize, usize, f64) {
    let tests = cases.len();
    let failures = cases
        .iter()
        .filter(|c| matches!(c.status, TestStatus::Failed))
        .count();
    let errors = cases
        .iter()
        .filter(|c| matches!(c.status, TestStatus::TimedOut))
        .count();
    let skipped = cases
        .iter()
        .filter(|c| matches!(c.status, TestStatus::Skipped))
        .count();
    let total_time: f64 = cases.iter().map(|c| c.duration.as_secs_f64()).sum();
    (tests, failures, errors, skipped, total_time)
}

/// Renders one `<testsuite>` per distinct test file, in first-seen order,
/// wrapped in a single `<testsuites>` root whose totals sum every case.
fn render_testsuite(cases: &[CaseRecord]) -> String {
    let all: Vec<&CaseRecord> = cases.iter().collect();
    let (tests, failures, errors, _skipped, total_time) = counts(&all);

    let mut files: Vec<&str> = Vec::new();
    for case in cases {
        if !files.contains(&case.meta.file.as_str()) {
            files.push(&case.meta.file);
        }
    }

    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));
    let _ = writer.write_event(Event::Text(BytesText::new("\n")));

    let mut suites = BytesStart::new("testsuites");
    suites.push_attribute(("name", "corral"));
    suites.push_attribute(("tests", tests.to_string().as_str()));
    suites.push_attribute(("failures", failures.to_string().as_str()));
    suites.push_attribute(("errors", errors.to_string().as_str()));
    suites.push_attribute(("time", format!("{total_time:.3}").as_str()));
    let _ = writer.write_event(Event::Start(suites));
    let _ = writer.write_event(Event::Text(BytesText::new("\n")));

    for file in &files {
        let file_cases: Vec<&CaseRecord> = cases.iter().filter(|c| c.meta.file == *file).collect();
        let (f_tests, f_failures, f_errors, f_skipped, f_time) = counts(&file_cases);

        let mut suite = BytesStart::new("testsuite");
        suite.push_attribute(("name", *file));
        suite.push_attribute(("tests", f_tests.to_string().as_str()));
        suite.push_attribute(("failures", f_failures.to_string().as_str()));
        suite.push_attribute(("errors", f_errors.to_string().as_str()));
        suite.push_attribute(("skipped", f_skipped.to_string().as_str()));
        suite.push_attribute(("time", format!("{f_time:.3}").as_str()));
        let _ = writer.write_event(Event::Start(suite));

        for case in &file_cases {
            write_testcase(&mut writer, case);
        }

        let _ = writer.write_event(Event::End(BytesEnd::new("testsuite")));
        let _ = writer.write_event(Event::Text(BytesText::new("\n")));
    }

    let _ = writer.write_event(Event::End(BytesEnd::new("testsuites")));
    let _ = writer.write_event(Event::Text(BytesText::new("\n")));

    String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
}

fn write_testcase(writer: &mut Writer<Cursor<Vec<u8>>>, case: &CaseRecord) {
    let mut elem = BytesStart::new("testcase");
    elem.push_attribute(("classname", case.meta.classname.as_str()));
    elem.push_attribute(("name", case.meta.name.as_str()));
    elem.push_attribute(("time", format!("{:.3}", case.duration.as_secs_f64()).as_str()));

    let has_body = case.error.is_some()
        || matches!(case.status, TestStatus::Skipped)
        || !case.stdout.is_empty()
        || !case.stderr.is_empty();

    if !has_body {
        let _ = writer.write_event(Event::Empty(elem));
        return;
    }

    let _ = writer.write_event(Event::Start(elem));

    if matches!(case.status, TestStatus::Skipped) {
        let _ = writer.write_event(Event::Empty(BytesStart::new("skipped")));
    }

    if let Some(error) = &case.error {
        let tag = if matches!(case.status, TestStatus::TimedOut) {
            "error"
        } else {
            "failure"
        };
        let mut failure = BytesStart::new(tag);
        failure.push_attribute(("message", sanitize(&error.message).as_str()));
        let _ = writer.write_event(Event::Start(failure.clone()));
        let body = error
            .stack
            .as_deref()
            .map(sanitize)
            .unwrap_or_else(|| sanitize(&error.message));
        let _ = writer.write_event(Event::CData(BytesCData::new(&body)));
        let _ = writer.write_event(Event::End(BytesEnd::new(tag)));
    }

    if !case.stdout.is_empty() {
        let _ = writer.write_event(Event::Start(BytesStart::new("system-out")));
        let _ = writer.write_event(Event::CData(BytesCData::new(&sanitize(&case.stdout))));
        let _ = writer.write_event(Event::End(BytesEnd::new("system-out")));
    }
    if !case.stderr.is_empty() {
        let _ = writer.write_event(Event::Start(BytesStart::new("system-err")));
        let _ = writer.write_event(Event::CData(BytesCData::new(&sanitize(&case.stderr))));
        let _ = writer.write_event(Event::End(BytesEnd::new("system-err")));
    }

    let _ = writer.write_event(Event::End(BytesEnd::new("testcase")));
}

/// Strips ANSI escape sequences, then any control code XML 1.0 forbids
/// outright (everything below `0x20` except tab/lf/cr).
fn sanitize(input: &str) -> String {
    let without_ansi = strip_ansi(input);
    without_ansi
        .chars()
        .filter(|&c| c == '\t' || c == '\n' || c == '\r' || !c.is_control())
        .collect()
}

fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> HashMap<TestId, TestMeta> {
        let mut m = HashMap::new();
        m.insert(
            1,
            TestMeta {
                file: "a.test.js".to_string(),
                classname: "suite".to_string(),
                name: name.to_string(),
            },
        );
        m
    }

    #[tokio::test]
    async fn records_a_passing_test() {
        let reporter = JUnitReporter::new(PathBuf::from("/tmp/unused.xml")).with_test_meta(meta("passes"));
        reporter
            .on_test_end(1, &TestResult::new(TestStatus::Passed, Duration::from_millis(5)))
            .await;
        let cases = reporter.cases.lock().unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].meta.name, "passes");
    }

    #[test]
    fn sanitize_strips_ansi_and_control_codes() {
        let input = "\u{1b}[31mred\u{1b}[0m text\u{0007}bell";
        let cleaned = sanitize(input);
        assert_eq!(cleaned, "red textbell");
    }

    #[test]
    fn render_wraps_failure_message_in_cdata() {
        let cases = vec![CaseRecord {
            meta: TestMeta {
                file: "a.test.js".to_string(),
                classname: "suite".to_string(),
                name: "fails".to_string(),
            },
            status: TestStatus::Failed,
            duration: Duration::from_millis(1),
            error: Some(TestError {
                message: "boom".to_string(),
                stack: Some("at line 1".to_string()),
            }),
            stdout: String::new(),
            stderr: String::new(),
        }];
        let xml = render_testsuite(&cases);
        assert!(xml.contains("<![CDATA[at line 1]]>"));
    }

    #[test]
    fn render_emits_one_testsuite_per_file() {
        let cases = vec![
            CaseRecord {
                meta: TestMeta {
                    file: "a.test.js".to_string(),
                    classname: "a".to_string(),
                    name: "one".to_string(),
                },
                status: TestStatus::Passed,
                duration: Duration::from_millis(1),
                error: None,
                stdout: String::new(),
                stderr: String::new(),
            },
            CaseRecord {
                meta: TestMeta {
                    file: "b.test.js".to_string(),
                    classname: "b".to_string(),
                    name: "two".to_string(),
                },
                status: TestStatus::Passed,
                duration: Duration::from_millis(1),
                error: None,
                stdout: String::new(),
                stderr: String::new(),
            },
        ];
        let xml = render_testsuite(&cases);
        assert_eq!(xml.matches("<testsuite ").count(), 2);
        assert!(xml.contains(r#"name="a.test.js""#));
        assert!(xml.contains(r#"name="b.test.js""#));
    }
}
