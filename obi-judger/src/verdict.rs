use obi_protocol::common::{ExecutionResult, Outcome, Verdict, VerdictStatus};

use chrono::Utc;

/// Collapses every whitespace run into one space and drops trailing
/// whitespace.
pub fn normalize(output: &[u8]) -> Vec<u8> {
    let mut ans = Vec::with_capacity(output.len());
    let mut white = false;
    for &b in output {
        if b.is_ascii_whitespace() {
            if !white {
                ans.push(b' ');
            }
            white = true;
        } else {
            ans.push(b);
            white = false;
        }
    }
    if white {
        ans.pop();
    }
    ans
}

pub fn output_matches(actual: &[u8], expected: &[u8]) -> bool {
    normalize(actual) == normalize(expected)
}

/// The status one test case contributes, `None` when it passed.
pub fn judge_case(result: &ExecutionResult, expected: &[u8]) -> Option<VerdictStatus> {
    match result.outcome {
        Outcome::Ok if output_matches(&result.stdout, expected) => None,
        Outcome::Ok => Some(VerdictStatus::WrongAnswer),
        Outcome::CompileError => Some(VerdictStatus::CompileError),
        Outcome::TimeLimit => Some(VerdictStatus::TimeLimitExceeded),
        Outcome::MemoryLimit => Some(VerdictStatus::MemoryLimitExceeded),
        Outcome::RuntimeError => Some(VerdictStatus::RuntimeError),
        Outcome::InternalError => Some(VerdictStatus::InternalError),
    }
}

/// Folds per-case results, in declared order, into the final verdict.
///
/// Evaluation stops at the first failing case; results after it are ignored
/// and not counted. Fewer results than expected outputs without a failure
/// means judging was cut short, which is an internal error.
pub fn fold(results: &[ExecutionResult], expected: &[Vec<u8>]) -> Verdict {
    let mut verdict = Verdict::new(VerdictStatus::Accepted);

    for (idx, result) in results.iter().enumerate() {
        verdict.cases_run = idx + 1;
        verdict.time = verdict.time.max(result.time);
        verdict.memory = verdict.memory.max(result.memory);

        let failed = match (result.outcome, expected.get(idx)) {
            (Outcome::CompileError, _) => Some(VerdictStatus::CompileError),
            (_, Some(exp)) => judge_case(result, exp),
            (_, None) => Some(VerdictStatus::InternalError),
        };

        if let Some(status) = failed {
            verdict.status = status;
            if status == VerdictStatus::CompileError {
                // no test case was run
                verdict.cases_run = 0;
                verdict.compile_message = Some(result.stderr.clone());
            } else {
                verdict.failed_case = Some(idx);
            }
            verdict.updated_at = Utc::now();
            return verdict;
        }
    }

    if results.len() < expected.len() {
        verdict.status = VerdictStatus::InternalError;
        verdict.failed_case = Some(results.len());
    }

    verdict.updated_at = Utc::now();
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outcome: Outcome, stdout: &str) -> ExecutionResult {
        ExecutionResult {
            outcome,
            exit_code: Some(0),
            signal: None,
            time: 10,
            real_time: 12,
            memory: 1024,
            stdout: stdout.as_bytes().to_vec(),
            stderr: String::new(),
        }
    }

    #[test]
    fn normalization() {
        assert!(output_matches(b"2\n", b"2"));
        assert!(output_matches(b"1  2\n3", b"1 2 3"));
        assert!(output_matches(b"1\r\n2\r\n", b"1\n2"));
        assert!(output_matches(b"a\t\tb  \n\n\n", b"a b"));
        assert!(!output_matches(b"12", b"1 2"));
        assert!(!output_matches(b"2", b"3"));
        assert_eq!(normalize(b"  x"), b" x");
    }

    #[test]
    fn all_pass_is_accepted() {
        let results = vec![result(Outcome::Ok, "1\n"), result(Outcome::Ok, "2 ")];
        let expected = vec![b"1".to_vec(), b"2\n".to_vec()];
        let v = fold(&results, &expected);
        assert_eq!(v.status, VerdictStatus::Accepted);
        assert_eq!(v.failed_case, None);
        assert_eq!(v.cases_run, 2);
    }

    #[test]
    fn first_failure_wins() {
        // a timeout on case 0 beats the mismatch on case 1
        let results = vec![result(Outcome::TimeLimit, ""), result(Outcome::Ok, "wrong")];
        let expected = vec![b"1".to_vec(), b"2".to_vec()];
        let v = fold(&results, &expected);
        assert_eq!(v.status, VerdictStatus::TimeLimitExceeded);
        assert_eq!(v.failed_case, Some(0));
        assert_eq!(v.cases_run, 1);
    }

    #[test]
    fn wrong_answer_index() {
        let results = vec![
            result(Outcome::Ok, "1"),
            result(Outcome::Ok, "3"),
            result(Outcome::Ok, "3"),
        ];
        let expected = vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()];
        let v = fold(&results, &expected);
        assert_eq!(v.status, VerdictStatus::WrongAnswer);
        assert_eq!(v.failed_case, Some(1));
        assert_eq!(v.cases_run, 2);
    }

    #[test]
    fn outcome_mapping() {
        let cases = [
            (Outcome::MemoryLimit, VerdictStatus::MemoryLimitExceeded),
            (Outcome::RuntimeError, VerdictStatus::RuntimeError),
            (Outcome::InternalError, VerdictStatus::InternalError),
        ];
        for &(outcome, status) in &cases {
            let v = fold(&[result(outcome, "")], &[b"x".to_vec()]);
            assert_eq!(v.status, status);
            assert_eq!(v.failed_case, Some(0));
        }
    }

    #[test]
    fn compile_error_has_no_failed_case() {
        let mut ce = result(Outcome::CompileError, "");
        ce.stderr = "src.c:1: error".to_owned();
        let v = fold(&[ce], &[b"x".to_vec()]);
        assert_eq!(v.status, VerdictStatus::CompileError);
        assert_eq!(v.failed_case, None);
        assert_eq!(v.cases_run, 0);
        assert_eq!(v.compile_message.as_deref(), Some("src.c:1: error"));
    }

    #[test]
    fn cut_short_is_internal_error() {
        let v = fold(&[result(Outcome::Ok, "1")], &[b"1".to_vec(), b"2".to_vec()]);
        assert_eq!(v.status, VerdictStatus::InternalError);
        assert_eq!(v.failed_case, Some(1));
    }
}
