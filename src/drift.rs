use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub drifted: bool,
    pub changed_lines: usize,
    pub first_difference: Option<usize>,
    pub previous_digest: String,
    pub regenerated_digest: String,
}

impl DriftReport {
    pub fn detail(&self) -> String {
        match self.first_difference {
            Some(line) if self.drifted => format!(
                "drift: {} line(s) differ, first at line {}",
                self.changed_lines, line
            ),
            _ if self.drifted => "drift".to_string(),
            _ => "up to date".to_string(),
        }
    }
}

pub fn detect_drift(previous: Option<&str>, regenerated: &str, normalize: bool) -> DriftReport {
    let previous_text = previous.unwrap_or("");
    let (left, right) = if normalize {
        (normalize_text(previous_text), normalize_text(regenerated))
    } else {
        (previous_text.to_string(), regenerated.to_string())
    };

    let previous_digest = digest(&left);
    let regenerated_digest = digest(&right);

    if left == right {
        return DriftReport {
            drifted: false,
            changed_lines: 0,
            first_difference: None,
            previous_digest,
            regenerated_digest,
        };
    }

    let (changed_lines, first_difference) = compare_lines(&left, &right);
    DriftReport {
        drifted: true,
        changed_lines: changed_lines.max(1),
        first_difference,
        previous_digest,
        regenerated_digest,
    }
}

/// Positional line comparison, not a minimal diff. A difference only in the
/// final newline is reported at the last line.
fn compare_lines(left: &str, right: &str) -> (usize, Option<usize>) {
    let left_lines: Vec<&str> = left.lines().collect();
    let right_lines: Vec<&str> = right.lines().collect();
    let longest = left_lines.len().max(right_lines.len());

    let mut changed = 0usize;
    let mut first = None;
    for idx in 0..longest {
        if left_lines.get(idx) != right_lines.get(idx) {
            changed += 1;
            first.get_or_insert(idx + 1);
        }
    }
    (changed, first.or(Some(longest.max(1))))
}

/// CRLF to LF, trailing whitespace per line removed, trailing blank lines dropped.
pub fn normalize_text(text: &str) -> String {
    let mut lines: Vec<&str> = text
        .split('\n')
        .map(|line| line.trim_end_matches(['\r', ' ', '\t']))
        .collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

fn digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn drift_comment(output_file: &Path, working_directory: &Path) -> String {
    format!(
        "### Terraform documentation is out of date\n\n\
         `{file}` no longer matches the generated documentation for `{dir}`.\n\n\
         Regenerate it locally and commit the result:\n\n\
         ```sh\n\
         terraform-docs markdown table --output-file {file} --output-mode inject {dir}\n\
         ```\n",
        file = output_file.display(),
        dir = working_directory.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_is_not_drift() {
        let report = detect_drift(Some("# Module\n\n| a | b |\n"), "# Module\n\n| a | b |\n", false);
        assert!(!report.drifted);
        assert_eq!(report.changed_lines, 0);
        assert_eq!(report.previous_digest, report.regenerated_digest);
        assert_eq!(report.detail(), "up to date");
    }

    #[test]
    fn changed_line_is_located() {
        let previous = "# Module\n| input | default |\n| region | us-east-1 |\n";
        let regenerated = "# Module\n| input | default |\n| region | eu-west-1 |\n";
        let report = detect_drift(Some(previous), regenerated, false);
        assert!(report.drifted);
        assert_eq!(report.changed_lines, 1);
        assert_eq!(report.first_difference, Some(3));
        assert_eq!(report.detail(), "drift: 1 line(s) differ, first at line 3");
        assert_ne!(report.previous_digest, report.regenerated_digest);
    }

    #[test]
    fn whitespace_churn_is_drift_unless_normalized() {
        let previous = "# Module\n| a | b |\n";
        let regenerated = "# Module  \r\n| a | b |\r\n\n\n";

        let strict = detect_drift(Some(previous), regenerated, false);
        assert!(strict.drifted);

        let normalized = detect_drift(Some(previous), regenerated, true);
        assert!(!normalized.drifted);
    }

    #[test]
    fn normalization_keeps_real_changes() {
        let report = detect_drift(Some("a\nb\n"), "a \nc\n", true);
        assert!(report.drifted);
        assert_eq!(report.first_difference, Some(2));
    }

    #[test]
    fn missing_previous_file_with_output_is_drift() {
        let report = detect_drift(None, "# Module\n", false);
        assert!(report.drifted);
        assert_eq!(report.first_difference, Some(1));

        let report = detect_drift(None, "", false);
        assert!(!report.drifted);
    }

    #[test]
    fn appended_lines_count_as_changes() {
        let report = detect_drift(Some("a\n"), "a\nb\nc\n", false);
        assert!(report.drifted);
        assert_eq!(report.first_difference, Some(2));
        assert_eq!(report.changed_lines, 2);

        let report = detect_drift(Some("a\n"), "a\nb\n", false);
        assert_eq!(report.changed_lines, 1);
        assert_eq!(report.detail(), "drift: 1 line(s) differ, first at line 2");
    }

    #[test]
    fn empty_and_missing_file_drift_alike() {
        let regenerated = "# Module\n\n## Inputs\n";
        let empty = detect_drift(Some(""), regenerated, false);
        let missing = detect_drift(None, regenerated, false);
        assert_eq!(empty.changed_lines, 3);
        assert_eq!(missing.changed_lines, empty.changed_lines);
        assert_eq!(missing.first_difference, empty.first_difference);
    }

    #[test]
    fn final_newline_alone_is_drift() {
        let report = detect_drift(Some("a\nb"), "a\nb\n", false);
        assert!(report.drifted);
        assert_eq!(report.changed_lines, 1);
        assert_eq!(report.first_difference, Some(2));
    }

    #[test]
    fn comment_names_file_and_command() {
        let body = drift_comment(Path::new("README.md"), Path::new("infra"));
        assert!(body.contains("`README.md`"));
        assert!(body.contains("--output-file README.md --output-mode inject infra"));
    }
}
