//! Build log parsing.
//!
//! Converts raw CI logs into a `FailureContextBundle`. Recognizers cover
//! Python tracebacks, JS/TS errors, Java exceptions, Go panics, pytest
//! failure lines, and GCC-style `file:line:col: error:` diagnostics.
//! Output preserves source order; the summary takes the first significant
//! lines.

use std::sync::LazyLock;

use regex::Regex;

use super::{
    BuildError, ContextError, FailureContextBundle, IssueSeverity, StackFrame, StackTrace,
    TestFailure,
};

static GCC_DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^\s:]+):(?P<line>\d+):(?:(?P<col>\d+):)?\s*(?P<sev>error|warning):\s*(?P<msg>.+)$")
        .unwrap()
});

static PYTEST_FAILED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^FAILED\s+(?P<file>[^\s:]+)::(?P<name>[^\s]+)(?:\s+-\s+(?P<msg>.+))?$").unwrap()
});

static PY_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*File "(?P<file>[^"]+)", line (?P<line>\d+)(?:, in (?P<func>.+))?$"#).unwrap()
});

static PY_EXCEPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<type>[A-Za-z_][A-Za-z0-9_.]*(?:Error|Exception|Warning|Interrupt|Exit)):\s*(?P<msg>.+)$").unwrap());

static JS_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:Uncaught\s+)?(?P<type>[A-Za-z]+Error):\s*(?P<msg>.+)$").unwrap()
});

static JS_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*at\s+(?:(?P<func>[^\s(]+)\s+\()?(?P<file>[^():]+):(?P<line>\d+):\d+\)?$")
        .unwrap()
});

static JAVA_EXCEPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:Exception in thread \S+\s+)?(?P<type>[a-z][a-z0-9_.]*\.[A-Za-z0-9$]*(?:Exception|Error)):\s*(?P<msg>.+)$")
        .unwrap()
});

static JAVA_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*at\s+(?P<func>[\w$.]+)\((?P<file>[^:)]+)(?::(?P<line>\d+))?\)$").unwrap()
});

static GO_PANIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^panic:\s*(?P<msg>.+)$").unwrap());

static GO_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<file>[^\s:]+\.go):(?P<line>\d+)(?:\s+\+0x[0-9a-f]+)?$").unwrap()
});

static GENERIC_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|failed|failure|fatal|cannot find|not found|missing)\b").unwrap()
});

/// Truncate a log to `max_bytes`, keeping the tail (failures cluster at
/// the end of CI logs).
pub fn truncate_log(log_text: &str, max_bytes: usize) -> (String, bool) {
    if log_text.len() <= max_bytes {
        return (log_text.to_string(), false);
    }
    let cut = log_text.len() - max_bytes;
    // Snap forward to the next line boundary so we never split a line.
    let tail_start = log_text[cut..]
        .find('\n')
        .map(|i| cut + i + 1)
        .unwrap_or(cut);
    (log_text[tail_start..].to_string(), true)
}

pub struct ContextBuilder {
    max_log_bytes: usize,
    summary_lines: usize,
}

impl ContextBuilder {
    pub fn new(max_log_bytes: usize) -> Self {
        Self {
            max_log_bytes,
            summary_lines: 10,
        }
    }

    /// Parse a raw build log into a structured context bundle.
    pub fn build(
        &self,
        event_id: &str,
        repo: &str,
        commit_sha: &str,
        branch: &str,
        pipeline_id: &str,
        job_name: &str,
        raw_log: &str,
    ) -> FailureContextBundle {
        let (log, _truncated) = truncate_log(raw_log, self.max_log_bytes);
        let lines: Vec<&str> = log.lines().collect();

        let mut errors = Vec::new();
        let mut build_errors = Vec::new();
        let mut test_failures = Vec::new();
        let mut stack_traces = Vec::new();

        let mut i = 0;
        while i < lines.len() {
            let line = lines[i].trim_end();

            if line.contains("Traceback (most recent call last)") {
                let (trace, consumed) = parse_python_traceback(&lines[i..]);
                if let Some(trace) = trace {
                    stack_traces.push(trace);
                }
                i += consumed.max(1);
                continue;
            }

            if let Some(cap) = GO_PANIC.captures(line) {
                // Goroutine dumps interleave function names with file
                // frames; scan a bounded window for the latter.
                let window_end = (i + 16).min(lines.len());
                let frames: Vec<StackFrame> = lines[i + 1..window_end]
                    .iter()
                    .filter_map(|l| GO_FRAME.captures(l))
                    .map(|c| StackFrame {
                        file: c["file"].to_string(),
                        line: c["line"].parse().ok(),
                        function: None,
                    })
                    .collect();
                stack_traces.push(StackTrace {
                    exception_type: "panic".to_string(),
                    message: cap["msg"].to_string(),
                    frames,
                });
                i = window_end;
                continue;
            }

            if let Some(cap) = JAVA_EXCEPTION.captures(line) {
                let (frames, consumed) =
                    collect_frames(&lines[i + 1..], &JAVA_FRAME, Some("func"));
                stack_traces.push(StackTrace {
                    exception_type: cap["type"].to_string(),
                    message: cap["msg"].to_string(),
                    frames,
                });
                i += consumed + 1;
                continue;
            }

            if let Some(cap) = JS_ERROR.captures(line) {
                let (frames, consumed) = collect_frames(&lines[i + 1..], &JS_FRAME, Some("func"));
                if !frames.is_empty() {
                    stack_traces.push(StackTrace {
                        exception_type: cap["type"].to_string(),
                        message: cap["msg"].to_string(),
                        frames,
                    });
                    i += consumed + 1;
                    continue;
                }
                // No frames: record as a plain error line below.
            }

            if let Some(cap) = PYTEST_FAILED.captures(line) {
                test_failures.push(TestFailure {
                    test_name: cap["name"].to_string(),
                    test_file: Some(cap["file"].to_string()),
                    error_message: cap
                        .name("msg")
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_else(|| "test failed".to_string()),
                });
                i += 1;
                continue;
            }

            if let Some(cap) = GCC_DIAGNOSTIC.captures(line) {
                let severity = if &cap["sev"] == "error" {
                    IssueSeverity::Error
                } else {
                    IssueSeverity::Warning
                };
                build_errors.push(BuildError {
                    file: cap["file"].to_string(),
                    line: cap["line"].parse().ok(),
                    column: cap.name("col").and_then(|c| c.as_str().parse().ok()),
                    message: cap["msg"].to_string(),
                    severity,
                });
                i += 1;
                continue;
            }

            if !line.trim().is_empty() && GENERIC_ERROR.is_match(line) {
                let context_lines: Vec<String> = lines
                    [i.saturating_sub(1)..(i + 2).min(lines.len())]
                    .iter()
                    .map(|l| l.to_string())
                    .collect();
                errors.push(ContextError {
                    message: line.trim().to_string(),
                    severity: IssueSeverity::Error,
                    location: None,
                    context_lines,
                });
            }
            i += 1;
        }

        let log_summary = summarize(&lines, self.summary_lines);

        FailureContextBundle {
            event_id: event_id.to_string(),
            repo: repo.to_string(),
            commit_sha: commit_sha.to_string(),
            branch: branch.to_string(),
            pipeline_id: pipeline_id.to_string(),
            job_name: job_name.to_string(),
            errors,
            build_errors,
            test_failures,
            stack_traces,
            log_summary,
        }
    }
}

fn collect_frames(
    lines: &[&str],
    frame_re: &Regex,
    func_group: Option<&str>,
) -> (Vec<StackFrame>, usize) {
    let mut frames = Vec::new();
    let mut consumed = 0;
    for line in lines {
        if let Some(cap) = frame_re.captures(line) {
            frames.push(StackFrame {
                file: cap["file"].to_string(),
                line: cap.name("line").and_then(|m| m.as_str().parse().ok()),
                function: func_group
                    .and_then(|g| cap.name(g))
                    .map(|m| m.as_str().to_string()),
            });
            consumed += 1;
        } else if line.trim().is_empty() || line.starts_with("goroutine ") {
            // Blank separators and goroutine headers do not end a trace.
            consumed += 1;
        } else {
            break;
        }
    }
    (frames, consumed)
}

fn parse_python_traceback(lines: &[&str]) -> (Option<StackTrace>, usize) {
    let mut frames = Vec::new();
    let mut consumed = 1; // the Traceback header
    let mut idx = 1;
    while idx < lines.len() {
        let line = lines[idx];
        if let Some(cap) = PY_FRAME.captures(line) {
            frames.push(StackFrame {
                file: cap["file"].to_string(),
                line: cap["line"].parse().ok(),
                function: cap.name("func").map(|m| m.as_str().to_string()),
            });
            idx += 1;
            consumed += 1;
            // Skip the echoed source line under the frame, if present.
            if idx < lines.len()
                && lines[idx].starts_with("    ")
                && !PY_FRAME.is_match(lines[idx])
            {
                idx += 1;
                consumed += 1;
            }
            continue;
        }
        if let Some(cap) = PY_EXCEPTION.captures(line.trim()) {
            consumed += 1;
            return (
                Some(StackTrace {
                    exception_type: cap["type"].to_string(),
                    message: cap["msg"].to_string(),
                    frames,
                }),
                consumed,
            );
        }
        break;
    }
    if frames.is_empty() {
        (None, consumed)
    } else {
        (
            Some(StackTrace {
                exception_type: "Exception".to_string(),
                message: "unrecognized exception line".to_string(),
                frames,
            }),
            consumed,
        )
    }
}

fn summarize(lines: &[&str], limit: usize) -> String {
    let significant: Vec<&str> = lines
        .iter()
        .filter(|l| {
            let t = l.trim();
            !t.is_empty()
                && (GENERIC_ERROR.is_match(t)
                    || GCC_DIAGNOSTIC.is_match(t)
                    || PYTEST_FAILED.is_match(t)
                    || t.contains("Traceback"))
        })
        .take(limit)
        .copied()
        .collect();
    if significant.is_empty() {
        lines
            .iter()
            .filter(|l| !l.trim().is_empty())
            .take(limit)
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        significant.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(log: &str) -> FailureContextBundle {
        ContextBuilder::new(1024 * 1024).build(
            "evt-1",
            "org/app",
            "deadbeef",
            "main",
            "42",
            "test-unit",
            log,
        )
    }

    #[test]
    fn python_traceback_is_parsed_with_frames() {
        let log = r#"collecting tests
Traceback (most recent call last):
  File "src/app/main.py", line 3, in <module>
    import requests
ModuleNotFoundError: No module named 'requests'
"#;
        let bundle = build(log);
        assert_eq!(bundle.stack_traces.len(), 1);
        let trace = &bundle.stack_traces[0];
        assert_eq!(trace.exception_type, "ModuleNotFoundError");
        assert_eq!(trace.message, "No module named 'requests'");
        assert_eq!(trace.frames.len(), 1);
        assert_eq!(trace.frames[0].file, "src/app/main.py");
        assert_eq!(trace.frames[0].line, Some(3));
    }

    #[test]
    fn pytest_failed_lines_become_test_failures() {
        let log = "FAILED tests/test_auth.py::test_login - AssertionError: expected 200\n";
        let bundle = build(log);
        assert_eq!(bundle.test_failures.len(), 1);
        assert_eq!(bundle.test_failures[0].test_name, "test_login");
        assert_eq!(
            bundle.test_failures[0].test_file.as_deref(),
            Some("tests/test_auth.py")
        );
        assert!(bundle.test_failures[0].error_message.contains("expected 200"));
    }

    #[test]
    fn gcc_diagnostics_become_build_errors() {
        let log = "src/lib.c:42:7: error: unknown type name 'u32'\nsrc/lib.c:50:1: warning: unused variable\n";
        let bundle = build(log);
        assert_eq!(bundle.build_errors.len(), 2);
        assert_eq!(bundle.build_errors[0].file, "src/lib.c");
        assert_eq!(bundle.build_errors[0].line, Some(42));
        assert_eq!(bundle.build_errors[0].column, Some(7));
        assert_eq!(bundle.build_errors[0].severity, IssueSeverity::Error);
        assert_eq!(bundle.build_errors[1].severity, IssueSeverity::Warning);
    }

    #[test]
    fn go_panic_collects_go_frames() {
        let log = r#"panic: runtime error: index out of range [3]

goroutine 1 [running]:
main.process(...)
	/app/main.go:27 +0x1d
"#;
        let bundle = build(log);
        assert_eq!(bundle.stack_traces.len(), 1);
        assert_eq!(bundle.stack_traces[0].exception_type, "panic");
        assert!(
            bundle.stack_traces[0]
                .frames
                .iter()
                .any(|f| f.file == "/app/main.go" && f.line == Some(27))
        );
    }

    #[test]
    fn java_exception_collects_at_frames() {
        let log = r#"Exception in thread "main" java.lang.NullPointerException: boom
	at com.example.App.run(App.java:13)
	at com.example.App.main(App.java:5)
"#;
        let bundle = build(log);
        assert_eq!(bundle.stack_traces.len(), 1);
        let trace = &bundle.stack_traces[0];
        assert_eq!(trace.exception_type, "java.lang.NullPointerException");
        assert_eq!(trace.frames.len(), 2);
        assert_eq!(trace.frames[0].file, "App.java");
        assert_eq!(trace.frames[0].line, Some(13));
    }

    #[test]
    fn js_error_with_frames_is_a_stack_trace() {
        let log = r#"TypeError: Cannot read properties of undefined
    at render (src/ui/panel.ts:88:12)
    at main (src/index.ts:10:3)
"#;
        let bundle = build(log);
        assert_eq!(bundle.stack_traces.len(), 1);
        assert_eq!(bundle.stack_traces[0].exception_type, "TypeError");
        assert_eq!(bundle.stack_traces[0].frames[0].file, "src/ui/panel.ts");
    }

    #[test]
    fn generic_error_lines_are_captured_in_order() {
        let log = "step one ok\nnpm ERR! missing script: test\nError: something broke\n";
        let bundle = build(log);
        assert_eq!(bundle.errors.len(), 2);
        assert!(bundle.errors[0].message.contains("npm ERR!"));
        assert!(bundle.errors[1].message.contains("something broke"));
    }

    #[test]
    fn summary_prefers_significant_lines() {
        let log = "setup\ninstalling\nError: kaboom\ndone\n";
        let bundle = build(log);
        assert_eq!(bundle.log_summary, "Error: kaboom");
    }

    #[test]
    fn truncation_keeps_the_tail() {
        let mut log = String::new();
        for i in 0..1000 {
            log.push_str(&format!("line {}\n", i));
        }
        let (truncated, was_truncated) = truncate_log(&log, 100);
        assert!(was_truncated);
        assert!(truncated.len() <= 100);
        assert!(truncated.contains("line 999"));
        assert!(!truncated.contains("line 0\n"));
    }

    #[test]
    fn truncation_noop_under_ceiling() {
        let (out, was_truncated) = truncate_log("short\n", 1000);
        assert!(!was_truncated);
        assert_eq!(out, "short\n");
    }

    #[test]
    fn significant_lines_feed_run_key_material() {
        let log = "Error: kaboom\nsrc/lib.c:1:1: error: bad\n";
        let bundle = build(log);
        let lines = bundle.significant_lines(5);
        assert!(!lines.is_empty());
        assert!(lines[0].contains("kaboom"));
    }
}
